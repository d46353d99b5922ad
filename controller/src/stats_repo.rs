//! Latest telemetry snapshot per connection.

use std::collections::HashMap;

use muster_core::ConnId;
use tokio::sync::RwLock;

/// One host telemetry report, as parsed from a STATUS reply.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Stats {
    pub conn_id: ConnId,
    pub cpu_percent: f32,
    pub mem_used_bytes: u64,
    pub mem_total_bytes: u64,
    pub disk_used_bytes: u64,
    pub disk_total_bytes: u64,
}

/// Keeps only the most recent report per connection id. Snapshot ordering is
/// unspecified.
#[derive(Default)]
pub struct StatsRepo {
    data: RwLock<HashMap<ConnId, Stats>>,
}

impl StatsRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any prior entry for the report's connection id, else insert.
    pub async fn upsert(&self, stats: Stats) {
        self.data.write().await.insert(stats.conn_id, stats);
    }

    /// Drop the entry for a connection; returns whether one existed.
    pub async fn remove_by_conn_id(&self, conn_id: ConnId) -> bool {
        self.data.write().await.remove(&conn_id).is_some()
    }

    pub async fn get(&self, conn_id: ConnId) -> Option<Stats> {
        self.data.read().await.get(&conn_id).copied()
    }

    pub async fn snapshot(&self) -> Vec<Stats> {
        self.data.read().await.values().copied().collect()
    }
}
