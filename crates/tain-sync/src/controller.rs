//! Reconciliation controller: worker pool over one kind's work queue
//!
//! A controller owns one work queue and one watch-cache adapter for a single
//! resource kind. It blocks until the cache reports its initial full sync,
//! then runs a configurable number of workers, each looping: dequeue a key,
//! invoke the kind's sync handler, route the result through retry
//! bookkeeping, and always mark the key done.
//!
//! A failed sync is requeued through the rate-limited path until the retry
//! ceiling, after which the key is dropped with a warning. Nothing propagates
//! past the controller; failures surface only as mirror lag.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::Api;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use tain_common::ObjectKey;

use crate::adapter::EventAdapter;
use crate::queue::{BackoffPolicy, WorkQueue};
use crate::watch::{spawn_watch, CacheEvent, WatchCache, WatchedObject};

/// Retry ceiling: a key is dropped after this many rate-limited requeues
pub const MAX_SYNC_RETRIES: u32 = 10;

/// Capacity of the cache-event channel between watch task and adapter
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Kind-specific sync logic invoked per dequeued key
///
/// Implementations fetch the live object from their cache, run the diff-merge
/// engine against the stored composite, and persist the result. A not-found
/// race is success, not an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SyncHandler: Send + Sync + 'static {
    /// Converge stored state for one key
    async fn sync(&self, key: &ObjectKey) -> tain_common::Result<()>;
}

/// One per-kind reconciliation controller
pub struct Controller<K: WatchedObject> {
    name: &'static str,
    cache: Arc<WatchCache<K>>,
    events: mpsc::Receiver<CacheEvent<K>>,
    handler: Arc<dyn SyncHandler>,
    queue: Arc<WorkQueue<ObjectKey>>,
    workers: usize,
}

impl<K: WatchedObject> Controller<K> {
    /// Create a controller over an already-wired cache and event channel
    pub fn new(
        name: &'static str,
        cache: Arc<WatchCache<K>>,
        events: mpsc::Receiver<CacheEvent<K>>,
        handler: Arc<dyn SyncHandler>,
        workers: usize,
    ) -> Self {
        Self {
            name,
            cache,
            events,
            handler,
            queue: Arc::new(WorkQueue::new(BackoffPolicy::default())),
            workers: workers.max(1),
        }
    }

    /// Work queue shared with the adapter; exposed for tests
    pub fn queue(&self) -> Arc<WorkQueue<ObjectKey>> {
        Arc::clone(&self.queue)
    }

    /// Run until the stop signal fires
    ///
    /// Blocks on the initial cache sync before starting any worker, then
    /// pumps adapter events and processes keys. The stop signal is checked
    /// between work items; an in-flight sync finishes undisturbed.
    pub async fn run(self, stop: CancellationToken) {
        let Controller {
            name,
            cache,
            events,
            handler,
            queue,
            workers,
        } = self;

        info!(controller = name, "waiting for initial cache sync");
        tokio::select! {
            _ = cache.wait_synced() => {}
            _ = stop.cancelled() => {
                debug!(controller = name, "stopped before cache sync");
                return;
            }
        }
        info!(
            controller = name,
            workers,
            cached = cache.len(),
            "cache synced, starting workers"
        );

        let adapter = EventAdapter::new(name, Arc::clone(&cache), Arc::clone(&queue));

        // Shut the queue down when the stop signal fires so blocked workers
        // return instead of waiting forever.
        let shutdown_queue = Arc::clone(&queue);
        let shutdown_stop = stop.clone();
        tokio::spawn(async move {
            shutdown_stop.cancelled().await;
            shutdown_queue.shut_down();
        });

        let mut pump_events = events;
        let pump_queue = Arc::clone(&queue);
        let pump: JoinHandle<()> = tokio::spawn(async move {
            while let Some(event) = pump_events.recv().await {
                if pump_queue.is_shutting_down() {
                    return;
                }
                adapter.handle(event);
            }
        });

        let mut worker_set = JoinSet::new();
        for index in 0..workers {
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            worker_set.spawn(async move {
                worker_loop(name, index, queue, handler).await;
            });
        }
        while worker_set.join_next().await.is_some() {}
        pump.abort();
        info!(controller = name, "stopped");
    }
}

/// Dequeue-sync-done loop for one worker task
async fn worker_loop(
    name: &'static str,
    index: usize,
    queue: Arc<WorkQueue<ObjectKey>>,
    handler: Arc<dyn SyncHandler>,
) {
    debug!(controller = name, worker = index, "worker started");
    while let Some(key) = queue.get().await {
        match handler.sync(&key).await {
            Ok(()) => queue.forget(&key),
            Err(error) => {
                let requeues = queue.num_requeues(&key);
                if requeues < MAX_SYNC_RETRIES {
                    debug!(
                        controller = name,
                        %key,
                        %error,
                        requeues,
                        "sync failed, requeuing with backoff"
                    );
                    queue.add_rate_limited(key.clone());
                } else {
                    warn!(
                        controller = name,
                        %key,
                        %error,
                        requeues,
                        "retry ceiling reached, dropping key"
                    );
                    queue.forget(&key);
                }
            }
        }
        queue.done(&key);
    }
    debug!(controller = name, worker = index, "worker exiting");
}

/// Wire up and start the full pipeline for one kind: watch task, cache,
/// adapter, and controller
///
/// The sync handler is built against the freshly created cache so it shares
/// the controller's view of live objects. Returns the controller task handle;
/// everything halts when `stop` fires.
pub fn start_kind_controller<K, F>(
    name: &'static str,
    api: Api<K>,
    workers: usize,
    stop: CancellationToken,
    make_handler: F,
) -> JoinHandle<()>
where
    K: WatchedObject,
    F: FnOnce(Arc<WatchCache<K>>) -> Arc<dyn SyncHandler>,
{
    let cache = Arc::new(WatchCache::<K>::new());
    let handler = make_handler(Arc::clone(&cache));
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let watch = spawn_watch(api, Arc::clone(&cache), tx, stop.clone());
    let controller = Controller::new(name, cache, rx, handler, workers);
    tokio::spawn(async move {
        controller.run(stop).await;
        watch.abort();
    })
}
