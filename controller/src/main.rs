//! # musterd
//!
//! Controller daemon for the muster fabric. Accepts long-lived agent
//! connections on a TCP listener, authenticates them with a shared token,
//! polls them periodically for host telemetry, and dispatches shell commands
//! from the interactive console — fire-and-forget to one agent, streamed
//! with live output, or broadcast to the whole fleet.
//!
//! ## Architecture
//!
//! ```text
//! main.rs       — entry point, config, wiring, graceful shutdown
//! manager.rs    — accept loop, live connection set, endpoint table
//! registry.rs   — wire handlers (AUTH/PING/STATUS/EXEC_OUT/EXEC_DONE/BYE)
//! cmd_repo.rs   — per-execution state machine with bounded output tail
//! stats_repo.rs — latest telemetry snapshot per connection
//! scheduler.rs  — periodic PING/STATUS broadcasts and record GC
//! dispatch.rs   — exec fan-out and wait-for-result consumer
//! console.rs    — operator REPL
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use muster_core::proto::commands;
use muster_core::ConnOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use muster_controller::console::Console;
use muster_controller::dispatch::ExecDispatcher;
use muster_controller::{
    CmdRepo, CommandRegistry, Config, ConnectionManager, Scheduler, StatsRepo,
};

/// muster controller daemon.
#[derive(Parser)]
#[command(name = "musterd", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref());

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("musterd v{} starting", env!("CARGO_PKG_VERSION"));
    if config.auth.token == "change-me" {
        warn!("Using default agent token — set MUSTER_TOKEN or update config");
    }

    let stats = Arc::new(StatsRepo::new());
    let cmds = Arc::new(CmdRepo::new(config.limits.tail_limit));
    let registry = CommandRegistry::new(
        Arc::clone(&stats),
        Arc::clone(&cmds),
        config.auth.token.clone(),
    );
    let manager = Arc::new(ConnectionManager::new(
        registry,
        Arc::clone(&stats),
        ConnOptions {
            max_frame_size: config.limits.max_frame_size,
            read_chunk: config.limits.read_chunk,
        },
    ));

    manager
        .start(&config.server.listen)
        .await
        .expect("Failed to bind listener");

    // Periodic keepalive, telemetry poll, and finished-record GC.
    let scheduler = Scheduler::new();
    {
        let manager = Arc::clone(&manager);
        scheduler
            .every(
                Duration::from_millis(config.poll.ping_interval_ms),
                move || {
                    let manager = Arc::clone(&manager);
                    async move {
                        manager.broadcast(commands::PING, Bytes::new()).await;
                    }
                },
            )
            .await;
    }
    {
        let manager = Arc::clone(&manager);
        scheduler
            .every(
                Duration::from_millis(config.poll.status_interval_ms),
                move || {
                    let manager = Arc::clone(&manager);
                    async move {
                        manager.broadcast(commands::STATUS, Bytes::new()).await;
                    }
                },
            )
            .await;
    }
    {
        let cmds = Arc::clone(&cmds);
        let max_age = Duration::from_secs(config.poll.gc_max_age_secs);
        scheduler
            .every(Duration::from_millis(config.poll.gc_interval_ms), move || {
                let cmds = Arc::clone(&cmds);
                async move {
                    let removed = cmds.clear_done_older_than(max_age).await;
                    if removed > 0 {
                        info!(removed, "collected finished command records");
                    }
                }
            })
            .await;
    }

    // SIGINT/SIGTERM cancel the shared token; the console loop observes it.
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut sigterm =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("Failed to register SIGTERM");
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
                info!("Received SIGINT");
            }
            shutdown.cancel();
        });
    }

    let dispatcher = ExecDispatcher::new(
        Arc::clone(&manager),
        Arc::clone(&cmds),
        Duration::from_secs(config.exec.wait_timeout_secs),
        Duration::from_millis(config.exec.poll_interval_ms),
    );
    let console = Console::new(
        Arc::clone(&manager),
        Arc::clone(&stats),
        dispatcher,
        shutdown.clone(),
    );
    console.run().await;

    info!("Shutting down...");
    shutdown.cancel();
    scheduler.stop().await;
    manager.stop().await;
    info!("Goodbye");
}
