//! Deduplicating work queue with per-key single flight.
//!
//! A key is either waiting, being processed, or both (it was re-added while
//! a worker held it). A key re-added while processing is handed out again
//! only after [`WorkQueue::done`], so no two workers ever reconcile the same
//! key at once. Adding a key that is already waiting is a no-op.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::BackoffConfig;

/// Counters for queue activity.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    added: AtomicU64,
    deduplicated: AtomicU64,
    handed_out: AtomicU64,
    retries: AtomicU64,
}

impl QueueMetrics {
    /// Keys accepted by `add`.
    #[must_use]
    pub fn added(&self) -> u64 {
        self.added.load(Ordering::Relaxed)
    }

    /// Adds that found the key already waiting.
    #[must_use]
    pub fn deduplicated(&self) -> u64 {
        self.deduplicated.load(Ordering::Relaxed)
    }

    /// Keys handed to workers.
    #[must_use]
    pub fn handed_out(&self) -> u64 {
        self.handed_out.load(Ordering::Relaxed)
    }

    /// Rate-limited requeues.
    #[must_use]
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Snapshot as JSON.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "added": self.added(),
            "deduplicated": self.deduplicated(),
            "handed_out": self.handed_out(),
            "retries": self.retries(),
        })
    }
}

#[derive(Debug)]
struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

impl<K> Default for QueueState<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            shutting_down: false,
        }
    }
}

struct Shared<K> {
    state: Mutex<QueueState<K>>,
    ready: Notify,
    failures: DashMap<K, u32>,
    backoff: BackoffConfig,
    metrics: QueueMetrics,
}

/// Work queue of reconcile keys.
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> std::fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("metrics", &self.shared.metrics)
            .finish_non_exhaustive()
    }
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Creates a queue whose failure requeues follow `backoff`.
    #[must_use]
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                ready: Notify::new(),
                failures: DashMap::new(),
                backoff,
                metrics: QueueMetrics::default(),
            }),
        }
    }

    /// Queue activity counters.
    #[must_use]
    pub fn metrics(&self) -> &QueueMetrics {
        &self.shared.metrics
    }

    /// Marks `key` as needing a reconcile.
    pub fn add(&self, key: K) {
        let mut state = self.shared.state.lock();
        if state.shutting_down {
            return;
        }
        if !state.dirty.insert(key.clone()) {
            self.shared.metrics.deduplicated.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.shared.metrics.added.fetch_add(1, Ordering::Relaxed);
        if !state.processing.contains(&key) {
            state.queue.push_back(key);
            drop(state);
            self.shared.ready.notify_one();
        }
    }

    /// Adds `key` once `delay` has passed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Requeues `key` after its next backoff delay and returns the delay.
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let attempt = {
            let mut failures = self.shared.failures.entry(key.clone()).or_insert(0);
            let attempt = *failures;
            *failures = failures.saturating_add(1);
            attempt
        };
        self.shared.metrics.retries.fetch_add(1, Ordering::Relaxed);
        let delay = self.shared.backoff.delay(attempt);
        self.add_after(key, delay);
        delay
    }

    /// Resets the failure count of `key`.
    pub fn forget(&self, key: &K) {
        self.shared.failures.remove(key);
    }

    /// Number of rate-limited requeues since the last `forget`.
    #[must_use]
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.shared.failures.get(key).map_or(0, |f| *f)
    }

    /// Waits for the next key. Returns `None` once the queue is shut down.
    ///
    /// The caller must pass the key to [`WorkQueue::done`] when finished.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    self.shared.metrics.handed_out.fetch_add(1, Ordering::Relaxed);
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Releases `key`, requeueing it if it was added while processing.
    pub fn done(&self, key: &K) {
        let mut state = self.shared.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.shared.ready.notify_one();
        }
    }

    /// Stops handing out keys and wakes every waiting worker.
    pub fn shut_down(&self) {
        self.shared.state.lock().shutting_down = true;
        self.shared.ready.notify_waiters();
    }

    /// Returns true after [`WorkQueue::shut_down`].
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }

    /// Number of keys waiting to be handed out.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Returns true if no key is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently held by workers.
    #[must_use]
    pub fn in_progress(&self) -> usize {
        self.shared.state.lock().processing.len()
    }
}
