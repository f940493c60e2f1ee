//! Keyed, deduplicating, rate-limited work queue
//!
//! The queue tracks three states per key: pending (queued, not yet handed
//! out), in-flight (handed out by [`WorkQueue::get`], not yet returned via
//! [`WorkQueue::done`]), and dirty (re-added while in-flight). A key is never
//! handed to two workers at once — this is the at-most-one-concurrent-sync-
//! per-key guarantee the controllers rely on.
//!
//! Re-adds after handler failure go through [`WorkQueue::add_rate_limited`],
//! which delays the enqueue by an exponential per-key backoff. The requeue
//! counter survives until [`WorkQueue::forget`] resets it on success or on a
//! retry-ceiling drop.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

/// Exponential per-item backoff policy
///
/// Delay for the n-th requeue of a key is `base * 2^n`, capped at `max`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first requeue
    pub base: Duration,
    /// Upper bound on any single delay
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given requeue count (0-based)
    pub fn delay(&self, requeues: u32) -> Duration {
        // Shift saturates well before overflow matters; 2^32 * 5ms >> max.
        let exp = requeues.min(32);
        let delay = self
            .base
            .checked_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
            .unwrap_or(self.max);
        delay.min(self.max)
    }
}

/// Trait bound alias for work-queue keys
pub trait QueueKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}
impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> QueueKey for T {}

struct Inner<K> {
    queue: VecDeque<K>,
    /// Keys pending or in-flight that have an outstanding add
    dirty: HashSet<K>,
    /// Keys handed out by `get` and not yet returned via `done`
    processing: HashSet<K>,
    /// Per-key requeue counters for the rate limiter
    requeues: HashMap<K, u32>,
    shutting_down: bool,
}

/// Deduplicating keyed work queue with in-flight tracking
pub struct WorkQueue<K: QueueKey> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
    backoff: BackoffPolicy,
}

impl<K: QueueKey> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

impl<K: QueueKey> WorkQueue<K> {
    /// Create a queue with the given backoff policy
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                requeues: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            backoff,
        }
    }

    /// Enqueue a key unless it is already pending or dirty
    ///
    /// If the key is currently in-flight it is only marked dirty; `done` will
    /// re-queue it immediately.
    pub fn add(&self, key: K) {
        let mut inner = self.lock();
        if inner.shutting_down {
            return;
        }
        if inner.dirty.contains(&key) {
            return;
        }
        inner.dirty.insert(key.clone());
        if inner.processing.contains(&key) {
            trace!(?key, "key in-flight, deferring requeue to done()");
            return;
        }
        inner.queue.push_back(key);
        drop(inner);
        self.notify.notify_one();
    }

    /// Dequeue the next key, blocking until one is available
    ///
    /// Marks the key in-flight. Returns `None` once the queue is shut down
    /// and drained of handed-out work.
    pub async fn get(&self) -> Option<K> {
        loop {
            // Arm the wakeup before inspecting state so a concurrent add or
            // shutdown between the check and the await is not lost.
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                // Shutdown wins over pending work: no new sync starts after
                // the stop signal, even for keys already queued.
                if inner.shutting_down {
                    return None;
                }
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    // Wake another waiter in case more items are queued.
                    if !inner.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Clear in-flight status for a key returned by `get`
    ///
    /// If the key was re-added while in-flight it is queued again
    /// immediately.
    pub fn done(&self, key: &K) {
        let mut inner = self.lock();
        inner.processing.remove(key);
        if inner.dirty.contains(key) && !inner.shutting_down {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Re-enqueue a key after its per-key exponential backoff delay
    ///
    /// Increments the requeue counter; the delay doubles with each call for
    /// the same key until `forget` resets it.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = {
            let mut inner = self.lock();
            if inner.shutting_down {
                return;
            }
            let count = inner.requeues.entry(key.clone()).or_insert(0);
            let delay = self.backoff.delay(*count);
            *count += 1;
            delay
        };
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Reset the requeue counter for a key (success or retry-ceiling drop)
    pub fn forget(&self, key: &K) {
        self.lock().requeues.remove(key);
    }

    /// Number of times the key has been requeued through the rate limiter
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().requeues.get(key).copied().unwrap_or(0)
    }

    /// Number of keys pending (not counting in-flight keys)
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no keys are pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cause all blocked `get` calls to return `None` and reject new adds
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Whether `shut_down` has been called
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K>> {
        // Lock poisoning only happens if a holder panicked; propagating the
        // inner state is still sound for a queue of plain keys.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
