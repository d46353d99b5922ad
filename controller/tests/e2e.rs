//! End-to-end wire scenarios against the controller's handler set.
//!
//! The first group drives a registry-attached connection over an in-memory
//! duplex pipe with literal wire bytes. The second group runs the real
//! accept loop on a loopback listener with a scripted agent on the far side.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use muster_controller::dispatch::{ExecDispatcher, ExecTarget};
use muster_controller::{CmdRepo, CmdState, CommandRegistry, ConnectionManager, StatsRepo};
use muster_core::proto::parse_kv;
use muster_core::{ConnOptions, Connection, Frame, FrameCodec};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

const TOKEN: &str = "supersecret";

struct Harness {
    conn: Arc<Connection>,
    rx: ReadHalf<DuplexStream>,
    tx: WriteHalf<DuplexStream>,
    stats: Arc<StatsRepo>,
    cmds: Arc<CmdRepo>,
}

async fn harness(conn_id: i32) -> Harness {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let stats = Arc::new(StatsRepo::new());
    let cmds = Arc::new(CmdRepo::new(64 * 1024));
    let registry = CommandRegistry::new(Arc::clone(&stats), Arc::clone(&cmds), TOKEN);

    let conn = Connection::new(server, conn_id, None, ConnOptions::default());
    registry.attach(&conn).await;
    conn.start().await;

    let (rx, tx) = tokio::io::split(client);
    Harness {
        conn,
        rx,
        tx,
        stats,
        cmds,
    }
}

async fn expect_bytes(rx: &mut ReadHalf<DuplexStream>, expected: &[u8]) {
    let mut buf = vec![0u8; expected.len()];
    tokio::time::timeout(Duration::from_secs(2), rx.read_exact(&mut buf))
        .await
        .expect("timed out waiting for reply")
        .expect("connection closed early");
    assert_eq!(
        buf,
        expected,
        "got {:?}",
        String::from_utf8_lossy(&buf)
    );
}

async fn wait_for<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn successful_auth() {
    let mut h = harness(10).await;
    h.tx.write_all(b"16\nAUTH\nsupersecret").await.unwrap();
    expect_bytes(&mut h.rx, b"9\nOK\nagent\n").await;
    assert!(h.conn.is_authenticated());
}

#[tokio::test]
async fn bad_auth_is_rejected_without_closing() {
    let mut h = harness(11).await;
    h.tx.write_all(b"10\nAUTH\nwrong").await.unwrap();
    expect_bytes(&mut h.rx, b"17\nERR\nunauthorized\n").await;
    assert!(!h.conn.is_authenticated());
    assert!(h.conn.is_running());

    // The peer may authenticate subsequently.
    h.tx.write_all(b"16\nAUTH\nsupersecret").await.unwrap();
    expect_bytes(&mut h.rx, b"9\nOK\nagent\n").await;
    assert!(h.conn.is_authenticated());
}

#[tokio::test]
async fn auth_tolerates_legacy_leading_newline() {
    let mut h = harness(12).await;
    h.tx.write_all(b"17\nAUTH\n\nsupersecret").await.unwrap();
    expect_bytes(&mut h.rx, b"9\nOK\nagent\n").await;
    assert!(h.conn.is_authenticated());
}

#[tokio::test]
async fn ping_pong() {
    let mut h = harness(13).await;
    h.tx.write_all(b"5\nPING\n").await.unwrap();
    expect_bytes(&mut h.rx, b"5\nPONG\n").await;
}

#[tokio::test]
async fn unknown_command_gets_err() {
    let mut h = harness(14).await;
    h.tx.write_all(b"7\nBOGUS\n\n").await.unwrap();
    expect_bytes(&mut h.rx, b"16\nERR\nunknown_cmd\n").await;
}

#[tokio::test]
async fn bye_is_acknowledged() {
    let mut h = harness(15).await;
    h.tx.write_all(b"4\nBYE\n").await.unwrap();
    expect_bytes(&mut h.rx, b"7\nOK\nbye\n").await;
}

#[tokio::test]
async fn status_ingestion_converts_kb_to_bytes() {
    let mut h = harness(16).await;
    h.tx.write_all(b"16\nAUTH\nsupersecret").await.unwrap();
    expect_bytes(&mut h.rx, b"9\nOK\nagent\n").await;

    h.tx.write_all(b"45\nSTATUS\ncpu=12.5% mem=1024/2048 disk=500/1000\n")
        .await
        .unwrap();

    let stats = Arc::clone(&h.stats);
    wait_for(|| {
        let stats = Arc::clone(&stats);
        async move { stats.get(16).await.is_some() }
    })
    .await;

    let report = h.stats.get(16).await.unwrap();
    assert!((report.cpu_percent - 12.5).abs() < f32::EPSILON);
    assert_eq!(report.mem_used_bytes, 1_048_576);
    assert_eq!(report.mem_total_bytes, 2_097_152);
    assert_eq!(report.disk_used_bytes, 512_000);
    assert_eq!(report.disk_total_bytes, 1_024_000);
}

#[tokio::test]
async fn status_requires_auth() {
    let mut h = harness(17).await;
    h.tx.write_all(b"45\nSTATUS\ncpu=12.5% mem=1024/2048 disk=500/1000\n")
        .await
        .unwrap();
    expect_bytes(&mut h.rx, b"17\nERR\nunauthorized\n").await;
    assert!(h.stats.get(17).await.is_none());
}

#[tokio::test]
async fn exec_out_with_unknown_id_replies_invalid_id() {
    let mut h = harness(18).await;
    h.tx.write_all(b"16\nAUTH\nsupersecret").await.unwrap();
    expect_bytes(&mut h.rx, b"9\nOK\nagent\n").await;

    h.tx.write_all(b"19\nEXEC_OUT\nid=999\nhi\n").await.unwrap();
    expect_bytes(&mut h.rx, b"15\nERR\ninvalid_id\n").await;
}

#[tokio::test]
async fn exec_done_with_unknown_id_replies_invalid_id() {
    let mut h = harness(19).await;
    h.tx.write_all(b"16\nAUTH\nsupersecret").await.unwrap();
    expect_bytes(&mut h.rx, b"9\nOK\nagent\n").await;

    h.tx.write_all(b"24\nEXEC_DONE\nid=999 code=0\n").await.unwrap();
    expect_bytes(&mut h.rx, b"15\nERR\ninvalid_id\n").await;
}

#[tokio::test]
async fn exec_done_with_nonpositive_id_or_code_is_ignored() {
    let mut h = harness(20).await;
    h.tx.write_all(b"16\nAUTH\nsupersecret").await.unwrap();
    expect_bytes(&mut h.rx, b"9\nOK\nagent\n").await;

    h.tx.write_all(b"22\nEXEC_DONE\nid=0 code=0\n").await.unwrap();
    h.tx.write_all(b"23\nEXEC_DONE\nid=5 code=-1\n").await.unwrap();

    // No ERR reply for either; a PING still round-trips afterwards.
    h.tx.write_all(b"5\nPING\n").await.unwrap();
    expect_bytes(&mut h.rx, b"5\nPONG\n").await;
}

#[tokio::test]
async fn exec_out_and_done_advance_the_record() {
    let mut h = harness(21).await;
    h.tx.write_all(b"16\nAUTH\nsupersecret").await.unwrap();
    expect_bytes(&mut h.rx, b"9\nOK\nagent\n").await;

    let id = h.cmds.add(0, 21, "echo hi", true).await;
    h.cmds.start(id).await;

    let out = format!("EXEC_OUT\nid={id}\nhi\n");
    h.tx.write_all(format!("{}\n{out}", out.len()).as_bytes())
        .await
        .unwrap();

    let cmds = Arc::clone(&h.cmds);
    wait_for(|| {
        let cmds = Arc::clone(&cmds);
        async move { cmds.get(id).await.unwrap().state == CmdState::Streaming }
    })
    .await;

    let done = format!("EXEC_DONE\nid={id} code=0\n");
    h.tx.write_all(format!("{}\n{done}", done.len()).as_bytes())
        .await
        .unwrap();

    let cmds = Arc::clone(&h.cmds);
    wait_for(|| {
        let cmds = Arc::clone(&cmds);
        async move { cmds.get(id).await.unwrap().state == CmdState::Done }
    })
    .await;

    let record = h.cmds.get(id).await.unwrap();
    assert_eq!(record.exit_code, 0);
    assert_eq!(record.tail, b"hi\n");
    assert_eq!(record.chunks_out, 1);
}

// ─── Full-stack scenarios over loopback TCP ──────────────────────────────────

struct Stack {
    manager: Arc<ConnectionManager>,
    stats: Arc<StatsRepo>,
    cmds: Arc<CmdRepo>,
    addr: std::net::SocketAddr,
}

async fn stack() -> Stack {
    let stats = Arc::new(StatsRepo::new());
    let cmds = Arc::new(CmdRepo::new(64 * 1024));
    let registry = CommandRegistry::new(Arc::clone(&stats), Arc::clone(&cmds), TOKEN);
    let manager = Arc::new(ConnectionManager::new(
        registry,
        Arc::clone(&stats),
        ConnOptions::default(),
    ));
    let addr = manager.start("127.0.0.1:0").await.unwrap();
    Stack {
        manager,
        stats,
        cmds,
        addr,
    }
}

/// Scripted agent: authenticates, then answers every EXEC with one
/// `EXEC_OUT` chunk (when monitored) and an `EXEC_DONE`.
async fn scripted_agent(addr: std::net::SocketAddr) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut wire = Framed::new(stream, FrameCodec::default());
    wire.send(Frame::new("AUTH", TOKEN)).await.unwrap();

    while let Some(frame) = wire.next().await {
        let Ok(frame) = frame else { break };
        if frame.command == "EXEC" {
            let text = frame.payload_str().into_owned();
            let (header, rest) = text.split_once('\n').unwrap_or((text.as_str(), ""));
            let kv = parse_kv(header);
            let id = kv["id"].clone();
            if kv.get("monitor").map(String::as_str) == Some("1") {
                wire.send(Frame::new("EXEC_OUT", format!("id={id}\nhi\n")))
                    .await
                    .unwrap();
            }
            let code = if rest.trim().is_empty() { 127 } else { 0 };
            wire.send(Frame::new("EXEC_DONE", format!("id={id} code={code}\n")))
                .await
                .unwrap();
        }
    }
}

async fn wait_for_agents(stack: &Stack, count: usize) {
    let manager = Arc::clone(&stack.manager);
    wait_for(move || {
        let manager = Arc::clone(&manager);
        async move {
            let conns = manager.connections().await;
            conns.len() == count && conns.iter().all(|c| c.is_authenticated())
        }
    })
    .await;
}

#[tokio::test]
async fn monitored_exec_streams_and_completes() {
    let stack = stack().await;
    let agent = tokio::spawn(scripted_agent(stack.addr));
    wait_for_agents(&stack, 1).await;

    let conn_id = stack.manager.connections().await[0].id();
    let dispatcher = ExecDispatcher::new(
        Arc::clone(&stack.manager),
        Arc::clone(&stack.cmds),
        Duration::from_secs(10),
        Duration::from_millis(20),
    );
    dispatcher
        .run_exec(ExecTarget::One(conn_id), "echo hi")
        .await;

    let records = stack.cmds.snapshot().await;
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.state, CmdState::Done);
    assert_eq!(record.conn_id, conn_id);
    assert!(record.monitor);
    assert_eq!(record.exit_code, 0);
    assert!(record.tail.ends_with(b"hi\n"));
    assert!(record.chunks_out >= 1);

    stack.manager.stop().await;
    agent.abort();
}

#[tokio::test]
async fn broadcast_exec_reaches_every_agent() {
    let stack = stack().await;
    let agents = [
        tokio::spawn(scripted_agent(stack.addr)),
        tokio::spawn(scripted_agent(stack.addr)),
    ];
    wait_for_agents(&stack, 2).await;

    let dispatcher = ExecDispatcher::new(
        Arc::clone(&stack.manager),
        Arc::clone(&stack.cmds),
        Duration::from_secs(10),
        Duration::from_millis(20),
    );
    dispatcher.run_exec(ExecTarget::All, "true").await;

    let records = stack.cmds.snapshot().await;
    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(record.state, CmdState::Done);
        assert_eq!(record.exit_code, 0);
        assert!(!record.monitor);
    }

    stack.manager.stop().await;
    for agent in agents {
        agent.abort();
    }
}

#[tokio::test]
async fn broadcast_exec_to_empty_fleet_creates_no_records() {
    let stack = stack().await;
    let dispatcher = ExecDispatcher::new(
        Arc::clone(&stack.manager),
        Arc::clone(&stack.cmds),
        Duration::from_secs(2),
        Duration::from_millis(20),
    );
    dispatcher.run_exec(ExecTarget::All, "x").await;

    assert!(stack.cmds.snapshot().await.is_empty());
    stack.manager.stop().await;
}

#[tokio::test]
async fn status_flows_from_agent_to_repo_over_tcp() {
    let stack = stack().await;

    let addr = stack.addr;
    let agent = tokio::spawn(async move {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut wire = Framed::new(stream, FrameCodec::default());
        wire.send(Frame::new("AUTH", TOKEN)).await.unwrap();
        while let Some(frame) = wire.next().await {
            let Ok(frame) = frame else { break };
            if frame.command == "STATUS" {
                wire.send(Frame::new(
                    "STATUS",
                    "cpu=3.0% mem=100/200 disk=300/400\n",
                ))
                .await
                .unwrap();
            }
        }
    });

    wait_for_agents(&stack, 1).await;
    let conn_id = stack.manager.connections().await[0].id();

    stack
        .manager
        .broadcast("STATUS", bytes::Bytes::new())
        .await;

    let stats = Arc::clone(&stack.stats);
    wait_for(move || {
        let stats = Arc::clone(&stats);
        async move { stats.get(conn_id).await.is_some() }
    })
    .await;

    let report = stack.stats.get(conn_id).await.unwrap();
    assert_eq!(report.mem_used_bytes, 100 * 1024);
    assert_eq!(report.disk_total_bytes, 400 * 1024);

    stack.manager.stop().await;
    agent.abort();
}
