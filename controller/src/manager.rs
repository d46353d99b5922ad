//! Live connection set and accept loop.
//!
//! On every accepted socket the manager wraps the stream in a
//! [`Connection`], lets the [`CommandRegistry`] attach its handlers, starts
//! the reader, caches the endpoint under the connection id, and adds the
//! connection to the live set. Dead connections are reaped by whichever
//! operation next iterates the set; reaping also drops the endpoint entry
//! and the last telemetry snapshot for that id.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use muster_core::{ConnId, ConnOptions, Connection, Endpoint};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::registry::CommandRegistry;
use crate::stats_repo::StatsRepo;

pub struct ConnectionManager {
    registry: CommandRegistry,
    stats: Arc<StatsRepo>,
    options: ConnOptions,
    conns: Arc<Mutex<Vec<Arc<Connection>>>>,
    endpoints: Arc<Mutex<HashMap<ConnId, Endpoint>>>,
    running: Arc<AtomicBool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(registry: CommandRegistry, stats: Arc<StatsRepo>, options: ConnOptions) -> Self {
        Self {
            registry,
            stats,
            options,
            conns: Arc::new(Mutex::new(Vec::new())),
            endpoints: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            accept_task: Mutex::new(None),
        }
    }

    /// Bind the listener and spawn the accept loop. Returns the bound
    /// address (useful when binding port 0).
    pub async fn start(&self, listen: &str) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(listen).await?;
        let local = listener.local_addr()?;
        self.running.store(true, Ordering::SeqCst);

        let registry = self.registry.clone();
        let options = self.options;
        let conns = Arc::clone(&self.conns);
        let endpoints = Arc::clone(&self.endpoints);
        let running = Arc::clone(&self.running);

        let task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };

                let conn = match Connection::from_tcp(stream, options) {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(%peer, error = %e, "dropping connection without endpoint");
                        continue;
                    }
                };

                registry.attach(&conn).await;
                conn.start().await;

                if let Some(endpoint) = conn.endpoint().cloned() {
                    endpoints.lock().await.insert(conn.id(), endpoint);
                }
                info!(conn_id = conn.id(), %peer, "agent connected");
                conns.lock().await.push(conn);
            }
        });
        *self.accept_task.lock().await = Some(task);

        info!(%local, "listening for agents");
        Ok(local)
    }

    /// Close the listener, join the accept loop, and stop every connection.
    /// Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.accept_task.lock().await.take() {
            // Aborting drops the listener, which closes the accept socket.
            task.abort();
            let _ = task.await;
        }
        for conn in self.conns.lock().await.drain(..) {
            conn.stop().await;
        }
        self.endpoints.lock().await.clear();
    }

    /// Drop connections that are no longer running, along with their cached
    /// endpoint and telemetry.
    async fn reap(&self) {
        let dead: Vec<ConnId> = {
            let mut conns = self.conns.lock().await;
            let dead = conns
                .iter()
                .filter(|c| !c.is_running())
                .map(|c| c.id())
                .collect();
            conns.retain(|c| c.is_running());
            dead
        };
        if dead.is_empty() {
            return;
        }
        let mut endpoints = self.endpoints.lock().await;
        for conn_id in dead {
            endpoints.remove(&conn_id);
            self.stats.remove_by_conn_id(conn_id).await;
            info!(conn_id, "agent disconnected");
        }
    }

    /// Snapshot of the running connections, reaping dead ones first.
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.reap().await;
        self.conns.lock().await.clone()
    }

    /// Send to every running connection; individual failures are swallowed.
    pub async fn broadcast(&self, command: &str, payload: Bytes) {
        for conn in self.connections().await {
            if let Err(e) = conn.send(command, payload.clone()).await {
                warn!(conn_id = conn.id(), error = %e, "broadcast send failed");
            }
        }
    }

    /// Send to the one running connection with a matching id. Returns `true`
    /// iff such a connection was found and the wire write succeeded.
    pub async fn send(&self, command: &str, payload: Bytes, conn_id: ConnId) -> bool {
        for conn in self.connections().await {
            if conn.id() == conn_id {
                return conn.send(command, payload).await.is_ok();
            }
        }
        false
    }

    /// Endpoints of the connections accepted so far, keyed by connection id.
    pub async fn list_endpoints(&self) -> Vec<(ConnId, Endpoint)> {
        self.reap().await;
        self.endpoints
            .lock()
            .await
            .iter()
            .map(|(id, ep)| (*id, ep.clone()))
            .collect()
    }

    pub async fn endpoint(&self, conn_id: ConnId) -> Option<Endpoint> {
        self.endpoints.lock().await.get(&conn_id).cloned()
    }
}
