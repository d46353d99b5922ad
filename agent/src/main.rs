//! # muster-agent
//!
//! Host-side agent for the muster fabric. Dials the controller, sends AUTH,
//! then serves telemetry polls and remote executions until the connection
//! drops or the controller says BYE. Connect failures back off exponentially
//! (1 s doubling to 30 s); an established connection that drops is redialed
//! after a short pause.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use muster_core::proto::commands;
use muster_core::{connect_with_timeout, ConnOptions, Connection};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use muster_agent::{handlers, Config};

/// muster agent daemon.
#[derive(Parser)]
#[command(name = "muster-agent", version)]
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

    info!("muster-agent v{} starting", env!("CARGO_PKG_VERSION"));
    if config.auth.token == "change-me" {
        warn!("Using default token — set MUSTER_AGENT_TOKEN or update config");
    }

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

    run(&config, &shutdown).await;
    info!("Goodbye");
}

/// Reconnect loop: dial, attach handlers, AUTH, then idle until the
/// connection ends or a shutdown is requested.
async fn run(config: &Config, shutdown: &CancellationToken) {
    let connect_timeout = Duration::from_secs(config.controller.connect_timeout_secs);
    let initial_delay = Duration::from_secs(config.reconnect.initial_delay_secs.max(1));
    let max_delay = Duration::from_secs(config.reconnect.max_delay_secs);
    let rejoin_delay = Duration::from_secs(config.reconnect.rejoin_delay_secs);
    let mut delay = initial_delay;

    while !shutdown.is_cancelled() {
        info!(addr = %config.controller.addr, "connecting to controller");
        let stream = match connect_with_timeout(&config.controller.addr, connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "connect failed, retrying in {}s", delay.as_secs());
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(max_delay);
                continue;
            }
        };
        delay = initial_delay;

        let conn = match Connection::from_tcp(stream, ConnOptions::default()) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "failed to wrap stream");
                continue;
            }
        };

        let want_close = Arc::new(AtomicBool::new(false));
        handlers::attach(
            &conn,
            config.telemetry.disk_path.clone(),
            Arc::clone(&want_close),
        )
        .await;
        conn.start().await;

        if let Err(e) = conn.send(commands::AUTH, config.auth.token.clone()).await {
            warn!(error = %e, "failed to send AUTH");
        }
        info!("connected");

        while conn.is_running() && !want_close.load(Ordering::SeqCst) && !shutdown.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        conn.stop().await;

        if want_close.load(Ordering::SeqCst) {
            info!("controller closed the session");
            break;
        }
        if shutdown.is_cancelled() {
            break;
        }

        info!("disconnected, retrying in {}s", rejoin_delay.as_secs());
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(rejoin_delay) => {}
        }
    }
}
