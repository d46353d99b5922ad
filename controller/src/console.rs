//! Interactive operator console.
//!
//! Reads commands from stdin and drives the manager, repositories, and exec
//! dispatcher. Ctrl-C (via the shared cancellation token) ends the console,
//! which in turn shuts the controller down.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use muster_core::proto::{commands, human_bytes, pct};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::dispatch::{ExecDispatcher, ExecTarget};
use crate::manager::ConnectionManager;
use crate::stats_repo::StatsRepo;
use crate::table::render_table;

/// Delay between a STATUS broadcast and rendering the table, giving agents
/// time to reply.
const STATUS_SETTLE: Duration = Duration::from_millis(150);

const HELP: &str = "\
Commands:
  status                           - request and print current status from all agents
  status -w [ms]                   - watch mode; refresh every [ms] (default 1500)
  exec <conn_id|all> <command...>  - execute command on agent(s)
  ls                               - list active connections
  endpoints                        - list connection endpoints
  clear                            - clear the screen
  quit | exit                      - leave the console";

pub struct Console {
    manager: Arc<ConnectionManager>,
    stats: Arc<StatsRepo>,
    dispatcher: ExecDispatcher,
    shutdown: CancellationToken,
}

impl Console {
    pub fn new(
        manager: Arc<ConnectionManager>,
        stats: Arc<StatsRepo>,
        dispatcher: ExecDispatcher,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            manager,
            stats,
            dispatcher,
            shutdown,
        }
    }

    /// Run the REPL until `quit`, stdin EOF, or cancellation.
    pub async fn run(&self) {
        println!("muster console — type 'help' for commands.");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            print!("> ");
            let _ = std::io::stdout().flush();

            let line = tokio::select! {
                () = self.shutdown.cancelled() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => line,
                    // EOF or a broken stdin both end the console.
                    Ok(None) | Err(_) => break,
                },
            };

            if !self.handle_line(line.trim()).await {
                break;
            }
        }
    }

    /// Returns `false` when the console should exit.
    async fn handle_line(&self, line: &str) -> bool {
        if line.is_empty() {
            return true;
        }
        let mut tokens = line.split_whitespace();
        let Some(cmd) = tokens.next() else {
            return true;
        };

        match cmd {
            "help" => println!("{HELP}"),
            "quit" | "exit" => return false,
            "clear" => print!("\x1b[2J\x1b[H"),
            "ls" => self.list_connections().await,
            "endpoints" => self.print_endpoints().await,
            "status" => {
                if tokens.next() == Some("-w") {
                    let interval_ms = tokens
                        .next()
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(1500)
                        .max(100);
                    self.run_status(true, interval_ms).await;
                } else {
                    self.run_status(false, 0).await;
                }
            }
            "exec" => {
                let rest = line[cmd.len()..].trim_start();
                let Some((target, command)) = rest.split_once(char::is_whitespace) else {
                    println!("usage: exec <conn_id|all> <cmd>");
                    return true;
                };
                let command = command.trim();
                if command.is_empty() {
                    println!("exec: missing command");
                    return true;
                }
                if target == "all" {
                    self.dispatcher.run_exec(ExecTarget::All, command).await;
                } else {
                    match target.parse::<i32>() {
                        Ok(conn_id) if conn_id > 0 => {
                            self.dispatcher
                                .run_exec(ExecTarget::One(conn_id), command)
                                .await;
                        }
                        _ => println!("exec: invalid target. use a numeric conn_id or 'all'"),
                    }
                }
            }
            _ => println!("unknown command. type 'help'."),
        }
        true
    }

    async fn list_connections(&self) {
        let rows = self.stats.snapshot().await;
        if rows.is_empty() {
            println!("no active connections");
            return;
        }
        let ids: Vec<String> = rows.iter().map(|s| s.conn_id.to_string()).collect();
        println!("Active connections (IDs): {}", ids.join(" "));
    }

    async fn run_status(&self, watch: bool, interval_ms: u64) {
        loop {
            self.manager
                .broadcast(commands::STATUS, Bytes::new())
                .await;
            tokio::time::sleep(STATUS_SETTLE).await;
            self.print_status().await;

            if !watch {
                return;
            }
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                () = tokio::time::sleep(Duration::from_millis(interval_ms)) => {}
            }
        }
    }

    async fn print_status(&self) {
        let rows: Vec<Vec<String>> = self
            .stats
            .snapshot()
            .await
            .iter()
            .map(|s| {
                vec![
                    s.conn_id.to_string(),
                    format!("{:.1}", s.cpu_percent),
                    format!(
                        "{}/{}",
                        human_bytes(s.mem_used_bytes),
                        human_bytes(s.mem_total_bytes)
                    ),
                    format!("{:.0}", pct(s.mem_used_bytes, s.mem_total_bytes)),
                    format!(
                        "{}/{}",
                        human_bytes(s.disk_used_bytes),
                        human_bytes(s.disk_total_bytes)
                    ),
                    format!("{:.0}", pct(s.disk_used_bytes, s.disk_total_bytes)),
                ]
            })
            .collect();

        print!(
            "{}",
            render_table(
                "Agent status",
                &["ID", "CPU%", "MEM (used/total)", "MEM%", "DISK (used/total)", "DSK%"],
                &rows,
            )
        );
    }

    async fn print_endpoints(&self) {
        let mut endpoints = self.manager.list_endpoints().await;
        endpoints.sort_by_key(|(id, _)| *id);
        let rows: Vec<Vec<String>> = endpoints
            .iter()
            .map(|(id, ep)| {
                vec![
                    id.to_string(),
                    ep.peer(),
                    ep.local(),
                    ep.family.to_string(),
                ]
            })
            .collect();
        print!(
            "{}",
            render_table("Endpoints", &["ID", "PEER", "LOCAL", "FAMILY"], &rows)
        );
    }
}
