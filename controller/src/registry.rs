//! Controller-side handler wiring.
//!
//! [`CommandRegistry::attach`] installs the controller's handlers on a
//! freshly accepted connection. AUTH flips the connection's authenticated
//! flag; STATUS, EXEC_OUT, and EXEC_DONE require it and reply
//! `ERR unauthorized` otherwise (without closing the connection, since the
//! peer may still authenticate).
//!
//! Header integers that fail to parse fall back to defaults rather than
//! failing the connection; only unknown correlation ids are answered with
//! `ERR invalid_id`.

use std::sync::Arc;

use muster_core::proto::{commands, parse_kv, split_first_line};
use muster_core::{handler, Connection};
use tracing::warn;

use crate::auth::constant_time_eq;
use crate::cmd_repo::CmdRepo;
use crate::stats_repo::{Stats, StatsRepo};

/// Declarative binder that attaches the controller-side handlers to any
/// connection. Cloneable; all clones share the same repositories.
#[derive(Clone)]
pub struct CommandRegistry {
    stats: Arc<StatsRepo>,
    cmds: Arc<CmdRepo>,
    token: Arc<str>,
}

impl CommandRegistry {
    pub fn new(stats: Arc<StatsRepo>, cmds: Arc<CmdRepo>, token: impl Into<Arc<str>>) -> Self {
        Self {
            stats,
            cmds,
            token: token.into(),
        }
    }

    pub async fn attach(&self, conn: &Arc<Connection>) {
        self.register_auth(conn).await;
        self.register_ping(conn).await;
        self.register_pong(conn).await;
        self.register_status(conn).await;
        self.register_exec_out(conn).await;
        self.register_exec_done(conn).await;
        self.register_bye(conn).await;
        self.register_default(conn).await;
    }

    async fn register_auth(&self, conn: &Arc<Connection>) {
        let token = Arc::clone(&self.token);
        conn.on(
            commands::AUTH,
            handler(move |conn, frame| {
                let token = Arc::clone(&token);
                async move {
                    // Trim tolerates a legacy sender that prefixed a newline.
                    let provided = frame.payload_str().trim().to_string();
                    if constant_time_eq(token.as_bytes(), provided.as_bytes()) {
                        conn.set_authenticated(true);
                        let _ = conn.send(commands::OK, "agent\n").await;
                    } else {
                        conn.set_authenticated(false);
                        let _ = conn.send(commands::ERR, "unauthorized\n").await;
                    }
                }
            }),
        )
        .await;
    }

    async fn register_ping(&self, conn: &Arc<Connection>) {
        conn.on(
            commands::PING,
            handler(|conn, _frame| async move {
                let _ = conn.send(commands::PONG, "").await;
            }),
        )
        .await;
    }

    async fn register_pong(&self, conn: &Arc<Connection>) {
        // Agent-initiated liveness; nothing to do.
        conn.on(commands::PONG, handler(|_conn, _frame| async {})).await;
    }

    async fn register_status(&self, conn: &Arc<Connection>) {
        let stats = Arc::clone(&self.stats);
        conn.on(
            commands::STATUS,
            handler(move |conn, frame| {
                let stats = Arc::clone(&stats);
                async move {
                    if !conn.is_authenticated() {
                        let _ = conn.send(commands::ERR, "unauthorized\n").await;
                        return;
                    }
                    let report = parse_status(conn.id(), &frame.payload_str());
                    stats.upsert(report).await;
                }
            }),
        )
        .await;
    }

    async fn register_exec_out(&self, conn: &Arc<Connection>) {
        let cmds = Arc::clone(&self.cmds);
        conn.on(
            commands::EXEC_OUT,
            handler(move |conn, frame| {
                let cmds = Arc::clone(&cmds);
                async move {
                    if !conn.is_authenticated() {
                        let _ = conn.send(commands::ERR, "unauthorized\n").await;
                        return;
                    }
                    let (header, chunk) = split_first_line(&frame.payload);
                    let kv = parse_kv(&String::from_utf8_lossy(header));
                    let id = kv
                        .get("id")
                        .and_then(|v| v.parse::<i64>().ok())
                        .unwrap_or(0);
                    if id <= 0 || chunk.is_empty() {
                        return;
                    }
                    if !cmds.append_out(id as u64, chunk).await {
                        let _ = conn.send(commands::ERR, "invalid_id\n").await;
                    }
                }
            }),
        )
        .await;
    }

    async fn register_exec_done(&self, conn: &Arc<Connection>) {
        let cmds = Arc::clone(&self.cmds);
        conn.on(
            commands::EXEC_DONE,
            handler(move |conn, frame| {
                let cmds = Arc::clone(&cmds);
                async move {
                    if !conn.is_authenticated() {
                        let _ = conn.send(commands::ERR, "unauthorized\n").await;
                        return;
                    }
                    let kv = parse_kv(&frame.payload_str());
                    let id = kv
                        .get("id")
                        .and_then(|v| v.parse::<i64>().ok())
                        .unwrap_or(0);
                    let code = kv
                        .get("code")
                        .and_then(|v| v.parse::<i32>().ok())
                        .unwrap_or(-1);
                    if id <= 0 || code < 0 {
                        return;
                    }
                    if !cmds.done(id as u64, code).await {
                        let _ = conn.send(commands::ERR, "invalid_id\n").await;
                    }
                }
            }),
        )
        .await;
    }

    async fn register_bye(&self, conn: &Arc<Connection>) {
        conn.on(
            commands::BYE,
            handler(|conn, _frame| async move {
                let _ = conn.send(commands::OK, "bye\n").await;
            }),
        )
        .await;
    }

    async fn register_default(&self, conn: &Arc<Connection>) {
        conn.set_default_handler(handler(|conn, frame| async move {
            warn!(conn_id = conn.id(), command = %frame.command, "unknown command");
            let _ = conn.send(commands::ERR, "unknown_cmd\n").await;
        }))
        .await;
    }
}

/// Parse a STATUS reply payload into a telemetry report.
///
/// The wire carries KB values (`mem=<used_kb>/<total_kb>`); they are
/// converted to bytes here. Malformed fields fall back to zero.
fn parse_status(conn_id: muster_core::ConnId, payload: &str) -> Stats {
    let kv = parse_kv(payload);
    let mut report = Stats {
        conn_id,
        ..Stats::default()
    };
    if let Some(cpu) = kv.get("cpu") {
        report.cpu_percent = cpu.trim_end_matches('%').parse().unwrap_or(0.0);
    }
    if let Some(mem) = kv.get("mem") {
        (report.mem_used_bytes, report.mem_total_bytes) = parse_kb_pair(mem);
    }
    if let Some(disk) = kv.get("disk") {
        (report.disk_used_bytes, report.disk_total_bytes) = parse_kb_pair(disk);
    }
    report
}

/// Parse `<used_kb>/<total_kb>` into a bytes pair.
fn parse_kb_pair(s: &str) -> (u64, u64) {
    let Some((used, total)) = s.split_once('/') else {
        return (0, 0);
    };
    (
        used.parse::<u64>().unwrap_or(0) * 1024,
        total.parse::<u64>().unwrap_or(0) * 1024,
    )
}
