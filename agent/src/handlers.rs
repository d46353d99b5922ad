//! Agent-side wire handler set.
//!
//! Mirrors the controller's registry: PING is answered with PONG, STATUS
//! with a telemetry snapshot, EXEC spawns the shell and reports back with
//! EXEC_OUT/EXEC_DONE, and BYE acknowledges then asks the main loop to shut
//! down. Unrecognized frames are logged and dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use muster_core::proto::{commands, parse_kv, split_first_line};
use muster_core::{handler, Connection};
use tracing::{debug, info};

use crate::exec::{stream_command, EXIT_SPAWN_FAILED};
use crate::telemetry;

/// Attach the agent handlers. `want_close` is flipped when the controller
/// says BYE; the reconnect loop watches it.
pub async fn attach(conn: &Arc<Connection>, disk_path: String, want_close: Arc<AtomicBool>) {
    register_ping(conn).await;
    register_status(conn, disk_path).await;
    register_exec(conn).await;
    register_bye(conn, want_close).await;
    register_default(conn).await;
}

async fn register_ping(conn: &Arc<Connection>) {
    conn.on(
        commands::PING,
        handler(|conn, _frame| async move {
            let _ = conn.send(commands::PONG, "").await;
        }),
    )
    .await;
}

async fn register_status(conn: &Arc<Connection>, disk_path: String) {
    conn.on(
        commands::STATUS,
        handler(move |conn, _frame| {
            let disk_path = disk_path.clone();
            async move {
                let report = telemetry::gather(&disk_path).await;
                let _ = conn.send(commands::STATUS, report).await;
            }
        }),
    )
    .await;
}

async fn register_exec(conn: &Arc<Connection>) {
    conn.on(
        commands::EXEC,
        handler(|conn, frame| async move {
            let (header, rest) = split_first_line(&frame.payload);
            let kv = parse_kv(&String::from_utf8_lossy(header));
            let id = kv
                .get("id")
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0);
            let monitor = matches!(
                kv.get("monitor").map(String::as_str),
                Some("1") | Some("true")
            );
            let cmd = String::from_utf8_lossy(rest).trim().to_string();
            info!(id, monitor, %cmd, "exec request");

            if cmd.is_empty() {
                let _ = conn
                    .send(commands::EXEC_DONE, format!("id={id} code={EXIT_SPAWN_FAILED}\n"))
                    .await;
                return;
            }

            let code = if monitor {
                let out_conn = Arc::clone(&conn);
                stream_command(&cmd, move |chunk| {
                    let conn = Arc::clone(&out_conn);
                    async move {
                        let mut payload = format!("id={id}\n").into_bytes();
                        payload.extend_from_slice(&chunk);
                        let _ = conn.send(commands::EXEC_OUT, payload).await;
                    }
                })
                .await
            } else {
                // Unmonitored: drain silently, report only the exit code.
                stream_command(&cmd, |_chunk| async {}).await
            };

            let _ = conn
                .send(commands::EXEC_DONE, format!("id={id} code={code}\n"))
                .await;
        }),
    )
    .await;
}

async fn register_bye(conn: &Arc<Connection>, want_close: Arc<AtomicBool>) {
    conn.on(
        commands::BYE,
        handler(move |conn, _frame| {
            let want_close = Arc::clone(&want_close);
            async move {
                let _ = conn.send(commands::OK, "bye\n").await;
                want_close.store(true, Ordering::SeqCst);
            }
        }),
    )
    .await;
}

async fn register_default(conn: &Arc<Connection>) {
    conn.set_default_handler(handler(|_conn, frame| async move {
        debug!(command = %frame.command, "unhandled frame from controller");
    }))
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use muster_core::{ConnOptions, Frame, FrameCodec};
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio_util::codec::Framed;

    async fn wired_agent() -> (Arc<Connection>, Framed<DuplexStream, FrameCodec>, Arc<AtomicBool>) {
        let (controller, agent) = tokio::io::duplex(64 * 1024);
        let conn = Connection::new(agent, 1, None, ConnOptions::default());
        let want_close = Arc::new(AtomicBool::new(false));
        attach(&conn, "/".to_string(), Arc::clone(&want_close)).await;
        conn.start().await;
        let wire = Framed::new(controller, FrameCodec::default());
        (conn, wire, want_close)
    }

    async fn next_frame(wire: &mut Framed<DuplexStream, FrameCodec>) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), wire.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("bad frame")
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (_conn, mut wire, _want_close) = wired_agent().await;
        wire.send(Frame::new("PING", "")).await.unwrap();
        let reply = next_frame(&mut wire).await;
        assert_eq!(reply.command, "PONG");
        assert!(reply.payload.is_empty());
    }

    #[tokio::test]
    async fn status_reply_has_the_wire_shape() {
        let (_conn, mut wire, _want_close) = wired_agent().await;
        wire.send(Frame::new("STATUS", "")).await.unwrap();
        let reply = next_frame(&mut wire).await;
        assert_eq!(reply.command, "STATUS");

        let text = reply.payload_str().into_owned();
        let kv = parse_kv(&text);
        assert!(kv["cpu"].ends_with('%'));
        assert!(kv["mem"].contains('/'));
        assert!(kv["disk"].contains('/'));
        assert!(text.ends_with('\n'));
    }

    #[tokio::test]
    async fn monitored_exec_streams_output_then_reports_done() {
        let (_conn, mut wire, _want_close) = wired_agent().await;
        wire.send(Frame::new("EXEC", "id=42 monitor=1\necho hi\n"))
            .await
            .unwrap();

        let mut output = Vec::new();
        loop {
            let frame = next_frame(&mut wire).await;
            match frame.command.as_str() {
                "EXEC_OUT" => {
                    let (header, chunk) = split_first_line(&frame.payload);
                    let kv = parse_kv(&String::from_utf8_lossy(header));
                    assert_eq!(kv["id"], "42");
                    output.extend_from_slice(chunk);
                }
                "EXEC_DONE" => {
                    let kv = parse_kv(&frame.payload_str());
                    assert_eq!(kv["id"], "42");
                    assert_eq!(kv["code"], "0");
                    break;
                }
                other => panic!("unexpected frame {other}"),
            }
        }
        assert_eq!(output, b"hi\n");
    }

    #[tokio::test]
    async fn unmonitored_exec_reports_only_done() {
        let (_conn, mut wire, _want_close) = wired_agent().await;
        wire.send(Frame::new("EXEC", "id=7 monitor=0\necho quiet\n"))
            .await
            .unwrap();

        let frame = next_frame(&mut wire).await;
        assert_eq!(frame.command, "EXEC_DONE");
        let kv = parse_kv(&frame.payload_str());
        assert_eq!(kv["id"], "7");
        assert_eq!(kv["code"], "0");
    }

    #[tokio::test]
    async fn empty_command_reports_127() {
        let (_conn, mut wire, _want_close) = wired_agent().await;
        wire.send(Frame::new("EXEC", "id=9 monitor=0\n\n")).await.unwrap();

        let frame = next_frame(&mut wire).await;
        assert_eq!(frame.command, "EXEC_DONE");
        let kv = parse_kv(&frame.payload_str());
        assert_eq!(kv["id"], "9");
        assert_eq!(kv["code"], "127");
    }

    #[tokio::test]
    async fn exec_failure_code_propagates() {
        let (_conn, mut wire, _want_close) = wired_agent().await;
        wire.send(Frame::new("EXEC", "id=5 monitor=0\nexit 3\n"))
            .await
            .unwrap();

        let frame = next_frame(&mut wire).await;
        let kv = parse_kv(&frame.payload_str());
        assert_eq!(kv["code"], "3");
    }

    #[tokio::test]
    async fn bye_acknowledges_and_requests_shutdown() {
        let (_conn, mut wire, want_close) = wired_agent().await;
        wire.send(Frame::new("BYE", "")).await.unwrap();

        let reply = next_frame(&mut wire).await;
        assert_eq!(reply.command, "OK");
        assert_eq!(&reply.payload[..], b"bye\n");
        assert!(want_close.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unknown_frames_are_dropped_silently() {
        let (_conn, mut wire, _want_close) = wired_agent().await;
        wire.send(Frame::new("MYSTERY", "payload")).await.unwrap();
        // No reply; a subsequent PING still round-trips.
        wire.send(Frame::new("PING", "")).await.unwrap();
        let reply = next_frame(&mut wire).await;
        assert_eq!(reply.command, "PONG");
    }
}
