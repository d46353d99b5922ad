//! Repository of outstanding and completed remote executions.
//!
//! Every EXEC dispatched to an agent gets a [`CmdRecord`] keyed by a
//! process-unique correlation id. The record advances through a one-way state
//! machine as EXEC_OUT chunks and the final EXEC_DONE arrive:
//!
//! ```text
//! Pending ──start──▶ Running ──append_out*──▶ Streaming ──done──▶ Done
//!                        └──────────────────done───────────────────┘
//! ```
//!
//! Streaming is only entered for monitored executions that have produced at
//! least one output chunk. Done is terminal.
//!
//! Output is accumulated in a bounded rolling tail: after any append, the
//! oldest bytes are trimmed so the tail holds the most recent `tail_limit`
//! bytes of the execution's output.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use muster_core::ConnId;
use tokio::sync::Mutex;

/// Correlation id of one remote execution, unique per process lifetime.
pub type CmdId = u64;

/// Default cap on a record's rolling output tail.
pub const DEFAULT_TAIL_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdState {
    Pending,
    Running,
    Streaming,
    Done,
}

/// One outstanding or completed remote execution.
#[derive(Debug, Clone)]
pub struct CmdRecord {
    pub id: CmdId,
    /// Connection the EXEC was sent on.
    pub conn_id: ConnId,
    /// The requested shell command.
    pub cmd: String,
    /// Whether streamed output was requested.
    pub monitor: bool,
    pub state: CmdState,
    /// `-1` until the record is Done.
    pub exit_code: i32,
    /// Total bytes received in EXEC_OUT frames.
    pub bytes_out: u64,
    /// Number of EXEC_OUT frames received.
    pub chunks_out: u64,
    pub created: Instant,
    pub started: Option<Instant>,
    pub last_update: Instant,
    pub finished: Option<Instant>,
    /// Rolling window of the newest output bytes, capped at the tail limit.
    pub tail: Vec<u8>,
}

impl CmdRecord {
    /// Tail rendered as text for display.
    pub fn tail_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.tail)
    }
}

struct Inner {
    records: HashMap<CmdId, CmdRecord>,
    tail_limit: usize,
}

/// Concurrent map of command records plus the monotonic id allocator.
pub struct CmdRepo {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl CmdRepo {
    pub fn new(tail_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                tail_limit,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh, strictly-increasing correlation id.
    pub fn next_id(&self) -> CmdId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Create a record in Pending. An `id` of 0 allocates one; an existing
    /// record with the same id is replaced. Returns the record's id.
    pub async fn add(&self, id: CmdId, conn_id: ConnId, cmd: &str, monitor: bool) -> CmdId {
        let id = if id == 0 { self.next_id() } else { id };
        let now = Instant::now();
        let record = CmdRecord {
            id,
            conn_id,
            cmd: cmd.to_string(),
            monitor,
            state: CmdState::Pending,
            exit_code: -1,
            bytes_out: 0,
            chunks_out: 0,
            created: now,
            started: None,
            last_update: now,
            finished: None,
            tail: Vec::new(),
        };
        self.inner.lock().await.records.insert(id, record);
        id
    }

    /// Mark the record Running (after a successful wire send).
    pub async fn start(&self, id: CmdId) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.records.get_mut(&id) else {
            return false;
        };
        if record.state == CmdState::Pending {
            record.state = CmdState::Running;
            record.started = Some(Instant::now());
            record.last_update = Instant::now();
        }
        true
    }

    /// Account one output chunk. Monitored records enter Streaming and append
    /// to the tail under the trimming policy. Appends after Done are ignored.
    pub async fn append_out(&self, id: CmdId, chunk: &[u8]) -> bool {
        let mut inner = self.inner.lock().await;
        let tail_limit = inner.tail_limit;
        let Some(record) = inner.records.get_mut(&id) else {
            return false;
        };
        if record.state == CmdState::Done {
            return true;
        }
        record.bytes_out += chunk.len() as u64;
        record.chunks_out += 1;
        if record.monitor {
            if matches!(record.state, CmdState::Running | CmdState::Streaming) {
                record.state = CmdState::Streaming;
            }
            record.tail.extend_from_slice(chunk);
            trim_tail(&mut record.tail, tail_limit);
        }
        record.last_update = Instant::now();
        true
    }

    /// Terminate the record with the agent-reported exit code.
    pub async fn done(&self, id: CmdId, exit_code: i32) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.records.get_mut(&id) else {
            return false;
        };
        if record.state == CmdState::Done {
            return true;
        }
        record.state = CmdState::Done;
        record.exit_code = exit_code;
        record.finished = Some(Instant::now());
        record.last_update = Instant::now();
        true
    }

    /// Snapshot copy of one record.
    pub async fn get(&self, id: CmdId) -> Option<CmdRecord> {
        self.inner.lock().await.records.get(&id).cloned()
    }

    /// Snapshot copy of every record.
    pub async fn snapshot(&self) -> Vec<CmdRecord> {
        self.inner.lock().await.records.values().cloned().collect()
    }

    /// Remove one record if present.
    pub async fn erase(&self, id: CmdId) -> bool {
        self.inner.lock().await.records.remove(&id).is_some()
    }

    /// Remove every record that targeted `conn_id`; returns how many.
    pub async fn remove_by_conn(&self, conn_id: ConnId) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.records.len();
        inner.records.retain(|_, r| r.conn_id != conn_id);
        before - inner.records.len()
    }

    /// Remove Done records that finished more than `age` ago; returns how many.
    pub async fn clear_done_older_than(&self, age: Duration) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.records.len();
        inner.records.retain(|_, r| {
            !(r.state == CmdState::Done && r.finished.is_some_and(|t| t.elapsed() > age))
        });
        before - inner.records.len()
    }

    /// Update the tail cap and retrim every existing tail.
    pub async fn set_tail_limit(&self, bytes: usize) {
        let mut inner = self.inner.lock().await;
        inner.tail_limit = bytes;
        for record in inner.records.values_mut() {
            trim_tail(&mut record.tail, bytes);
        }
    }
}

/// Keep only the newest `limit` bytes of `tail`.
fn trim_tail(tail: &mut Vec<u8>, limit: usize) {
    if limit == 0 {
        tail.clear();
    } else if tail.len() > limit {
        tail.drain(..tail.len() - limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ids_are_strictly_increasing() {
        let repo = CmdRepo::new(DEFAULT_TAIL_LIMIT);
        let mut last = 0;
        for _ in 0..100 {
            let id = repo.next_id();
            assert!(id > last);
            last = id;
        }
    }

    #[tokio::test]
    async fn add_with_zero_allocates_an_id() {
        let repo = CmdRepo::new(DEFAULT_TAIL_LIMIT);
        let id = repo.add(0, 3, "uptime", false).await;
        assert!(id > 0);
        let record = repo.get(id).await.unwrap();
        assert_eq!(record.state, CmdState::Pending);
        assert_eq!(record.conn_id, 3);
        assert_eq!(record.exit_code, -1);
    }

    #[tokio::test]
    async fn add_replaces_existing_record() {
        let repo = CmdRepo::new(DEFAULT_TAIL_LIMIT);
        let id = repo.add(0, 3, "first", true).await;
        repo.done(id, 0).await;
        repo.add(id, 4, "second", false).await;

        let record = repo.get(id).await.unwrap();
        assert_eq!(record.cmd, "second");
        assert_eq!(record.conn_id, 4);
        assert_eq!(record.state, CmdState::Pending);
    }

    #[tokio::test]
    async fn unmonitored_lifecycle() {
        let repo = CmdRepo::new(DEFAULT_TAIL_LIMIT);
        let id = repo.add(0, 1, "ls", false).await;

        assert!(repo.start(id).await);
        assert_eq!(repo.get(id).await.unwrap().state, CmdState::Running);

        // Chunks are counted but never put an unmonitored record in Streaming.
        assert!(repo.append_out(id, b"out").await);
        let record = repo.get(id).await.unwrap();
        assert_eq!(record.state, CmdState::Running);
        assert_eq!(record.bytes_out, 3);
        assert_eq!(record.chunks_out, 1);
        assert!(record.tail.is_empty());

        assert!(repo.done(id, 0).await);
        let record = repo.get(id).await.unwrap();
        assert_eq!(record.state, CmdState::Done);
        assert_eq!(record.exit_code, 0);
        assert!(record.finished.is_some());
    }

    #[tokio::test]
    async fn monitored_lifecycle_streams() {
        let repo = CmdRepo::new(DEFAULT_TAIL_LIMIT);
        let id = repo.add(0, 1, "echo hi", true).await;
        repo.start(id).await;

        repo.append_out(id, b"hi\n").await;
        let record = repo.get(id).await.unwrap();
        assert_eq!(record.state, CmdState::Streaming);
        assert_eq!(record.tail, b"hi\n");

        repo.done(id, 0).await;
        let record = repo.get(id).await.unwrap();
        assert_eq!(record.state, CmdState::Done);
        assert_eq!(record.tail, b"hi\n");
    }

    #[tokio::test]
    async fn done_is_terminal() {
        let repo = CmdRepo::new(DEFAULT_TAIL_LIMIT);
        let id = repo.add(0, 1, "x", true).await;
        repo.start(id).await;
        repo.done(id, 7).await;

        // Neither late chunks nor a second done move the record.
        assert!(repo.append_out(id, b"late").await);
        assert!(repo.done(id, 9).await);
        let record = repo.get(id).await.unwrap();
        assert_eq!(record.state, CmdState::Done);
        assert_eq!(record.exit_code, 7);
        assert_eq!(record.bytes_out, 0);
        assert!(record.tail.is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_are_rejected() {
        let repo = CmdRepo::new(DEFAULT_TAIL_LIMIT);
        assert!(!repo.start(99).await);
        assert!(!repo.append_out(99, b"x").await);
        assert!(!repo.done(99, 0).await);
        assert!(repo.get(99).await.is_none());
        assert!(!repo.erase(99).await);
    }

    #[tokio::test]
    async fn tail_is_a_rolling_window_of_newest_bytes() {
        let repo = CmdRepo::new(8);
        let id = repo.add(0, 1, "x", true).await;
        repo.start(id).await;

        let chunks: &[&[u8]] = &[b"abcd", b"efgh", b"ij", b"klmnopqrstuv"];
        let mut all = Vec::new();
        for chunk in chunks {
            repo.append_out(id, chunk).await;
            all.extend_from_slice(chunk);

            let record = repo.get(id).await.unwrap();
            assert!(record.tail.len() <= 8);
            let expected = &all[all.len().saturating_sub(8)..];
            assert_eq!(record.tail, expected);
        }

        let record = repo.get(id).await.unwrap();
        assert_eq!(record.bytes_out, all.len() as u64);
        assert_eq!(record.chunks_out, chunks.len() as u64);
    }

    #[tokio::test]
    async fn zero_tail_limit_keeps_tail_empty() {
        let repo = CmdRepo::new(0);
        let id = repo.add(0, 1, "x", true).await;
        repo.start(id).await;
        repo.append_out(id, b"data").await;

        let record = repo.get(id).await.unwrap();
        assert!(record.tail.is_empty());
        assert_eq!(record.bytes_out, 4);
    }

    #[tokio::test]
    async fn set_tail_limit_retrims_existing_tails() {
        let repo = CmdRepo::new(DEFAULT_TAIL_LIMIT);
        let id = repo.add(0, 1, "x", true).await;
        repo.start(id).await;
        repo.append_out(id, b"0123456789").await;

        repo.set_tail_limit(4).await;
        assert_eq!(repo.get(id).await.unwrap().tail, b"6789");

        repo.set_tail_limit(0).await;
        assert!(repo.get(id).await.unwrap().tail.is_empty());
    }

    #[tokio::test]
    async fn remove_by_conn_removes_only_matching() {
        let repo = CmdRepo::new(DEFAULT_TAIL_LIMIT);
        repo.add(0, 5, "a", false).await;
        repo.add(0, 5, "b", false).await;
        repo.add(0, 6, "c", false).await;

        assert_eq!(repo.remove_by_conn(5).await, 2);
        assert_eq!(repo.snapshot().await.len(), 1);
        assert_eq!(repo.remove_by_conn(5).await, 0);
    }

    #[tokio::test]
    async fn clear_done_older_than_respects_state_and_age() {
        let repo = CmdRepo::new(DEFAULT_TAIL_LIMIT);
        let done_id = repo.add(0, 1, "done", false).await;
        let live_id = repo.add(0, 1, "live", false).await;
        repo.start(done_id).await;
        repo.done(done_id, 0).await;
        repo.start(live_id).await;

        // Nothing is old enough yet.
        assert_eq!(repo.clear_done_older_than(Duration::from_secs(60)).await, 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(repo.clear_done_older_than(Duration::ZERO).await, 1);
        assert!(repo.get(done_id).await.is_none());
        // Unfinished records are never collected.
        assert!(repo.get(live_id).await.is_some());
    }
}
