//! Exec fan-out and the wait-for-result consumer.
//!
//! A single-target exec is monitored: streamed output is printed as it lands
//! in the record's tail. A broadcast exec is fire-and-forget per agent; the
//! dispatcher waits for each record and prints a summary.
//!
//! The wait loop polls the repository every 150 ms and gives up after a
//! 60-second wall-clock timeout without touching the record.

use std::sync::Arc;
use std::time::{Duration, Instant};

use muster_core::proto::commands;
use muster_core::ConnId;
use tracing::debug;

use crate::cmd_repo::{CmdId, CmdRepo, CmdState};
use crate::manager::ConnectionManager;

/// Where an exec goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecTarget {
    /// Every running connection, unmonitored.
    All,
    /// One connection, with output streaming.
    One(ConnId),
}

pub struct ExecDispatcher {
    manager: Arc<ConnectionManager>,
    repo: Arc<CmdRepo>,
    wait_timeout: Duration,
    poll_interval: Duration,
}

impl ExecDispatcher {
    pub fn new(
        manager: Arc<ConnectionManager>,
        repo: Arc<CmdRepo>,
        wait_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            manager,
            repo,
            wait_timeout,
            poll_interval,
        }
    }

    /// Launch a remote execution and wait for its result(s).
    pub async fn run_exec(&self, target: ExecTarget, cmd: &str) {
        match target {
            ExecTarget::All => self.run_all(cmd).await,
            ExecTarget::One(conn_id) => self.run_one(conn_id, cmd).await,
        }
    }

    async fn run_all(&self, cmd: &str) {
        let conns = self.manager.connections().await;
        if conns.is_empty() {
            println!("no active connections");
            return;
        }

        let mut launched: Vec<CmdId> = Vec::new();
        for conn in &conns {
            let id = self.repo.next_id();
            self.repo.add(id, conn.id(), cmd, false).await;
            if self.launch(id, conn.id(), cmd, false).await {
                launched.push(id);
            }
        }
        if launched.is_empty() {
            return;
        }

        for id in &launched {
            self.wait_done(*id, "all", false).await;
        }

        println!("[exec] summary:");
        for id in &launched {
            match self.repo.get(*id).await {
                Some(r) => println!(
                    "  id={} conn={} code={} out={}B chunks={}",
                    r.id, r.conn_id, r.exit_code, r.bytes_out, r.chunks_out
                ),
                None => println!("  id={id} no-result"),
            }
        }
    }

    async fn run_one(&self, conn_id: ConnId, cmd: &str) {
        let id = self.repo.next_id();
        self.repo.add(id, conn_id, cmd, true).await;
        if !self.launch(id, conn_id, cmd, true).await {
            return;
        }
        println!("[exec] launched id={id} on conn_id={conn_id} (monitor)");
        self.wait_done(id, "exec", true).await;
    }

    /// Send the EXEC frame; mark the record Running on success, drop it on
    /// failure.
    async fn launch(&self, id: CmdId, conn_id: ConnId, cmd: &str, monitor: bool) -> bool {
        let payload = format!("id={id} monitor={}\n{cmd}\n", u8::from(monitor));
        if self
            .manager
            .send(commands::EXEC, payload.into(), conn_id)
            .await
        {
            self.repo.start(id).await;
            true
        } else {
            println!("[exec] failed to send to conn_id={conn_id}");
            self.repo.erase(id).await;
            false
        }
    }

    /// Poll the record until Done or timeout. When `follow` is set, print
    /// each newly-appended suffix of the tail as it arrives.
    async fn wait_done(&self, id: CmdId, prefix: &str, follow: bool) {
        let deadline = Instant::now() + self.wait_timeout;
        let mut printed_bytes: u64 = 0;

        loop {
            if let Some(record) = self.repo.get(id).await {
                if follow && record.monitor && record.bytes_out > printed_bytes {
                    let fresh = (record.bytes_out - printed_bytes) as usize;
                    let start = record.tail.len().saturating_sub(fresh.min(record.tail.len()));
                    print!("{}", String::from_utf8_lossy(&record.tail[start..]));
                    printed_bytes = record.bytes_out;
                }
                if record.state == CmdState::Done {
                    println!(
                        "---- [{prefix} id={id} done] exit_code={} (bytes_out={}, chunks={})",
                        record.exit_code, record.bytes_out, record.chunks_out
                    );
                    if !follow && !record.tail.is_empty() {
                        print!("{}", record.tail_str());
                    }
                    return;
                }
            } else {
                debug!(id, "record vanished while waiting");
                return;
            }

            if Instant::now() >= deadline {
                println!("[{prefix} id={id}] timeout waiting result");
                return;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
