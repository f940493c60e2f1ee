//! Generic sync handler shared by the per-kind mirrors
//!
//! Each kind supplies a [`MirrorKind`] implementation: which live object type
//! it watches and how an observed object converts into a composite record.
//! The sync flow is the same everywhere: split the key, apply the namespace
//! filter, fetch the live object from the cache, and either remove the stored
//! composite (not-found) or diff-merge and persist.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::Api;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tain_common::{AuditFields, Audited, NamespaceFilter, ObjectKey, Result};
use tain_sync::controller::start_kind_controller;
use tain_sync::registry::{StartFn, SupervisorContext};
use tain_sync::store::CompositeStore;
use tain_sync::watch::{WatchCache, WatchedObject};
use tain_sync::{plan, Composite, CompositeKind, SyncHandler};

/// Per-kind conversion from a live object into a composite record
pub trait MirrorKind: CompositeKind + Sized {
    /// The live object type watched for this kind
    type Object: WatchedObject;

    /// Controller name used in the registry and logs
    const CONTROLLER: &'static str;

    /// Build the observed composite for one live object
    fn observe(
        cluster: &str,
        key: &ObjectKey,
        obj: &Self::Object,
    ) -> Composite<Self::Parent, Self::Child>;
}

/// Child type for kinds whose composites have no child rows
///
/// Never constructed; the diff engine sees empty child collections only.
#[derive(Debug, Clone, PartialEq)]
pub struct NoChild {
    audit: AuditFields,
}

impl Audited for NoChild {
    fn audit(&self) -> &AuditFields {
        &self.audit
    }
    fn audit_mut(&mut self) -> &mut AuditFields {
        &mut self.audit
    }
}

/// The shared sync handler: cache lookup, diff-merge, persist
pub struct Mirror<K: MirrorKind> {
    cluster: String,
    filter: NamespaceFilter,
    cache: Arc<WatchCache<K::Object>>,
    store: Arc<dyn CompositeStore<K>>,
}

impl<K: MirrorKind> Mirror<K> {
    /// Create a mirror over one cluster's cache and store handle
    pub fn new(
        cluster: impl Into<String>,
        filter: NamespaceFilter,
        cache: Arc<WatchCache<K::Object>>,
        store: Arc<dyn CompositeStore<K>>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            filter,
            cache,
            store,
        }
    }
}

#[async_trait]
impl<K: MirrorKind> SyncHandler for Mirror<K> {
    async fn sync(&self, key: &ObjectKey) -> Result<()> {
        if !self.filter.allows(key.namespace.as_deref()) {
            return Ok(());
        }
        let Some(obj) = self.cache.get(key) else {
            // Not-found race or deletion: converge by removing the stored
            // composite. Removing an already-absent record is a no-op.
            debug!(kind = K::KIND, %key, "live object absent, removing stored composite");
            return self.store.remove(&self.cluster, key).await;
        };

        let observed = K::observe(&self.cluster, key, obj.as_ref());
        let stored = self.store.load(&self.cluster, key).await?;
        let merge = plan::<K>(stored.as_ref(), &observed);
        if merge.is_noop() {
            return Ok(());
        }
        self.store.apply(&self.cluster, key, merge).await
    }
}

/// Registry start function for a kind using the shared mirror handler
pub fn registry_entry<K: MirrorKind>(store: Arc<dyn CompositeStore<K>>) -> StartFn {
    Box::new(move |ctx: &Arc<SupervisorContext>, stop: CancellationToken| {
        let api: Api<K::Object> = Api::all(ctx.client.clone());
        let cluster = ctx.cluster.clone();
        let filter = ctx.filter.clone();
        let store = Arc::clone(&store);
        Ok(start_kind_controller(
            K::CONTROLLER,
            api,
            ctx.workers,
            stop,
            move |cache| Arc::new(Mirror::<K>::new(cluster, filter, cache, store)),
        ))
    })
}

/// Spawn a controller task for tests and custom handlers
///
/// Same wiring as [`registry_entry`] but with a caller-supplied handler
/// factory, used by kinds whose sync path needs more than the shared mirror
/// (the application mirror's advisory lock and label write-back).
pub fn registry_entry_with<O, F>(controller: &'static str, make_handler: F) -> StartFn
where
    O: WatchedObject,
    F: Fn(&Arc<SupervisorContext>, Arc<WatchCache<O>>) -> Arc<dyn SyncHandler>
        + Send
        + Sync
        + 'static,
{
    let make_handler = Arc::new(make_handler);
    Box::new(move |ctx: &Arc<SupervisorContext>, stop: CancellationToken| {
        let api: Api<O> = Api::all(ctx.client.clone());
        let ctx_for_handler = Arc::clone(ctx);
        let make_handler = Arc::clone(&make_handler);
        Ok(start_kind_controller(
            controller,
            api,
            ctx.workers,
            stop,
            move |cache| make_handler(&ctx_for_handler, cache),
        ))
    })
}
