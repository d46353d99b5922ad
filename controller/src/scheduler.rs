//! Fixed-period job runner.
//!
//! A single loop ticks every ~10 ms; on each tick it fires every registered
//! job whose deadline has passed and reschedules it at `now + interval`, so
//! periods are lower bounds rather than absolute phases. Each firing runs on
//! its own detached task: a panicking or slow job cannot halt the loop or
//! starve other jobs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Cancellation handle returned by [`Scheduler::every`].
pub type JobId = u64;

/// Default tick period of the scheduler loop.
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);

type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Item {
    interval: Duration,
    job: Job,
    next_due: Instant,
}

pub struct Scheduler {
    items: Arc<Mutex<HashMap<JobId, Item>>>,
    next_id: AtomicU64,
    running: Arc<AtomicBool>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Start a scheduler loop with the default tick.
    pub fn new() -> Self {
        Self::with_tick(DEFAULT_TICK)
    }

    /// Start a scheduler loop with a custom tick period.
    pub fn with_tick(tick: Duration) -> Self {
        let items: Arc<Mutex<HashMap<JobId, Item>>> = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));

        let loop_items = Arc::clone(&items);
        let loop_running = Arc::clone(&running);
        let task = tokio::spawn(async move {
            while loop_running.load(Ordering::SeqCst) {
                let now = Instant::now();
                {
                    let mut items = loop_items.lock().await;
                    for item in items.values_mut() {
                        if item.next_due <= now {
                            tokio::spawn((item.job)());
                            item.next_due = now + item.interval;
                        }
                    }
                }
                tokio::time::sleep(tick).await;
            }
        });

        Self {
            items,
            next_id: AtomicU64::new(1),
            running,
            loop_task: Mutex::new(Some(task)),
        }
    }

    /// Register a job to fire every `interval`, starting one interval from
    /// now. Returns an id usable with [`Scheduler::cancel`].
    pub async fn every<F, Fut>(&self, interval: Duration, job: F) -> JobId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job: Job = Arc::new(move || -> BoxFuture<'static, ()> { Box::pin(job()) });
        self.items.lock().await.insert(
            id,
            Item {
                interval,
                job,
                next_due: Instant::now() + interval,
            },
        );
        id
    }

    /// Remove a job; firings already spawned still complete.
    pub async fn cancel(&self, id: JobId) {
        self.items.lock().await.remove(&id);
    }

    /// Stop the loop and clear the registry. Idempotent; returns once the
    /// loop task has exited (bounded by one tick).
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.loop_task.lock().await.take() {
            let _ = task.await;
        }
        self.items.lock().await.clear();
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
