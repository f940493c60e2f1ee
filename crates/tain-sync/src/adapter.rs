//! Watch-cache adapter: classified cache events to work-queue keys
//!
//! One adapter per resource kind. The rules:
//!
//! - **add**: re-resolve the object from the cache by key before enqueueing;
//!   if the cache no longer holds it, a later delete superseded this event
//!   and the removal path will enqueue instead.
//! - **update**: identical version tokens on both sides mean a periodic
//!   resync re-delivery; skip the enqueue.
//! - **remove**: direct deletions and tombstones both carry a key; an object
//!   with no derivable key is logged and dropped.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use tain_common::ObjectKey;

use crate::queue::WorkQueue;
use crate::watch::{object_key, version_token, CacheEvent, WatchCache, WatchedObject};

/// Turns cache events for one kind into work-queue keys
pub struct EventAdapter<K> {
    kind: &'static str,
    cache: Arc<WatchCache<K>>,
    queue: Arc<WorkQueue<ObjectKey>>,
}

impl<K: WatchedObject> EventAdapter<K> {
    /// Create an adapter feeding the given queue from the given cache
    pub fn new(
        kind: &'static str,
        cache: Arc<WatchCache<K>>,
        queue: Arc<WorkQueue<ObjectKey>>,
    ) -> Self {
        Self { kind, cache, queue }
    }

    /// Apply the enqueue rules to one classified event
    pub fn handle(&self, event: CacheEvent<K>) {
        match event {
            CacheEvent::Added(obj) => {
                let Some(key) = object_key(obj.as_ref()) else {
                    warn!(kind = self.kind, "add event without derivable key, dropping");
                    return;
                };
                // The cache may have advanced past this event; act on its
                // current view rather than the possibly superseded object.
                if self.cache.get(&key).is_none() {
                    debug!(kind = self.kind, %key, "added object already deleted, skipping");
                    return;
                }
                self.queue.add(key);
            }
            CacheEvent::Updated { old, new } => {
                match (version_token(old.as_ref()), version_token(new.as_ref())) {
                    (Some(old_rv), Some(new_rv)) if old_rv == new_rv => {
                        trace!(kind = self.kind, "resync re-delivery, skipping enqueue");
                        return;
                    }
                    _ => {}
                }
                let Some(key) = object_key(new.as_ref()) else {
                    warn!(kind = self.kind, "update event without derivable key, dropping");
                    return;
                };
                self.queue.add(key);
            }
            CacheEvent::Removed(removal) => match removal.key() {
                Some(key) => self.queue.add(key),
                None => {
                    warn!(kind = self.kind, "removal without derivable key, dropping");
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::Removal;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use kube::runtime::watcher;

    fn cm(name: &str, rv: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn setup() -> (
        Arc<WatchCache<ConfigMap>>,
        Arc<WorkQueue<ObjectKey>>,
        EventAdapter<ConfigMap>,
    ) {
        let cache = Arc::new(WatchCache::new());
        let queue = Arc::new(WorkQueue::default());
        let adapter = EventAdapter::new("configmap", Arc::clone(&cache), Arc::clone(&queue));
        (cache, queue, adapter)
    }

    #[tokio::test]
    async fn test_add_enqueues_key() {
        let (cache, queue, adapter) = setup();
        for ev in cache.ingest(watcher::Event::Apply(cm("a", "1"))) {
            adapter.handle(ev);
        }
        assert_eq!(queue.len(), 1);
        assert_eq!(
            queue.get().await.unwrap(),
            ObjectKey::namespaced("default", "a")
        );
    }

    #[tokio::test]
    async fn test_add_superseded_by_delete_is_skipped() {
        let (cache, queue, adapter) = setup();
        // The delete lands in the cache before the adapter sees the add.
        let add_events = cache.ingest(watcher::Event::Apply(cm("a", "1")));
        let del_events = cache.ingest(watcher::Event::Delete(cm("a", "1")));

        for ev in add_events {
            adapter.handle(ev);
        }
        assert!(queue.is_empty(), "superseded add must not enqueue");

        for ev in del_events {
            adapter.handle(ev);
        }
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_resync_with_same_version_token_is_suppressed() {
        let (cache, queue, adapter) = setup();
        cache.ingest(watcher::Event::Apply(cm("a", "7")));

        // Relist re-delivers the unchanged object.
        cache.ingest(watcher::Event::Init);
        let events = cache.ingest(watcher::Event::InitApply(cm("a", "7")));
        for ev in events {
            adapter.handle(ev);
        }
        assert!(queue.is_empty(), "resync no-op must not enqueue");
    }

    #[tokio::test]
    async fn test_real_update_enqueues() {
        let (cache, queue, adapter) = setup();
        cache.ingest(watcher::Event::Apply(cm("a", "1")));
        for ev in cache.ingest(watcher::Event::Apply(cm("a", "2"))) {
            adapter.handle(ev);
        }
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_tombstone_enqueues_unwrapped_key() {
        let (_cache, queue, adapter) = setup();
        adapter.handle(CacheEvent::Removed(Removal::Tombstone {
            key: ObjectKey::namespaced("default", "gone"),
            last_known: Arc::new(cm("gone", "3")),
        }));
        assert_eq!(queue.len(), 1);
        assert_eq!(
            queue.get().await.unwrap(),
            ObjectKey::namespaced("default", "gone")
        );
    }

    #[tokio::test]
    async fn test_removal_without_key_is_dropped() {
        let (_cache, queue, adapter) = setup();
        adapter.handle(CacheEvent::Removed(Removal::Object(Arc::new(
            ConfigMap::default(),
        ))));
        assert!(queue.is_empty());
    }
}
