//! Record-oriented store interface and the in-memory implementation
//!
//! The persistent-store driver is an external collaborator; mirrors consume
//! it through [`CompositeStore`], a record-oriented CRUD surface keyed by
//! `(cluster, object key)`. The in-memory implementation here backs tests and
//! the single-binary development mode; a SQL-backed driver plugs in behind
//! the same trait.
//!
//! The apply path is the single owner of audit-timestamp refresh: updates
//! touch `updated_at` and never rewrite `created_at`. No transaction spans a
//! parent write and its child writes — convergence relies on idempotent
//! re-application, which the diff engine guarantees.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use tain_common::{Audited, AuditFields, Error, ObjectKey, Result};

use crate::diff::{Composite, CompositeKind, DeletePolicy, MergePlan};

/// Record-oriented CRUD surface for one kind's composites
#[async_trait]
pub trait CompositeStore<K: CompositeKind>: Send + Sync + 'static {
    /// Load the stored composite for a key, if present and not soft-deleted
    async fn load(
        &self,
        cluster: &str,
        key: &ObjectKey,
    ) -> Result<Option<Composite<K::Parent, K::Child>>>;

    /// Execute a merge plan against the stored composite
    async fn apply(
        &self,
        cluster: &str,
        key: &ObjectKey,
        plan: MergePlan<K::Parent, K::Child>,
    ) -> Result<()>;

    /// Remove the stored composite per the kind's delete policy
    ///
    /// Removing an already-absent record is not an error.
    async fn remove(&self, cluster: &str, key: &ObjectKey) -> Result<()>;
}

/// Named advisory locks serializing multi-path updates to one logical record
///
/// The in-memory equivalent of a database advisory lock: callers holding the
/// guard for a name exclude every other acquirer of the same name.
#[derive(Default)]
pub struct AdvisoryLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AdvisoryLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the named lock, waiting until it is free
    pub async fn acquire(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            Arc::clone(
                locks
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}

/// In-memory composite store for one kind
///
/// Counts row writes so idempotency assertions in tests are exact.
pub struct MemoryStore<K: CompositeKind> {
    records: RwLock<HashMap<(String, ObjectKey), Composite<K::Parent, K::Child>>>,
    writes: AtomicU64,
    _kind: PhantomData<K>,
}

impl<K: CompositeKind> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            writes: AtomicU64::new(0),
            _kind: PhantomData,
        }
    }
}

impl<K: CompositeKind> MemoryStore<K>
where
    K::Parent: Audited,
    K::Child: Audited,
{
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Total row writes since creation
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of stored composites, including soft-deleted ones
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the store holds no composites
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw access to a stored composite, including soft-deleted rows
    pub fn peek(&self, cluster: &str, key: &ObjectKey) -> Option<Composite<K::Parent, K::Child>> {
        self.read().get(&record_key(cluster, key)).cloned()
    }

    fn read(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<(String, ObjectKey), Composite<K::Parent, K::Child>>>
    {
        match self.records.read() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<(String, ObjectKey), Composite<K::Parent, K::Child>>>
    {
        match self.records.write() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn bump(&self, n: u64) {
        self.writes.fetch_add(n, Ordering::SeqCst);
    }
}

fn record_key(cluster: &str, key: &ObjectKey) -> (String, ObjectKey) {
    (cluster.to_string(), key.clone())
}

#[async_trait]
impl<K: CompositeKind> CompositeStore<K> for MemoryStore<K>
where
    K::Parent: Audited,
    K::Child: Audited,
{
    async fn load(
        &self,
        cluster: &str,
        key: &ObjectKey,
    ) -> Result<Option<Composite<K::Parent, K::Child>>> {
        let records = self.read();
        Ok(records
            .get(&record_key(cluster, key))
            .filter(|c| !c.parent.audit().deleted)
            .cloned())
    }

    async fn apply(
        &self,
        cluster: &str,
        key: &ObjectKey,
        plan: MergePlan<K::Parent, K::Child>,
    ) -> Result<()> {
        if plan.is_noop() {
            return Ok(());
        }
        let now = Utc::now();
        let mut writes = 0u64;
        let mut records = self.write();
        let rkey = record_key(cluster, key);

        if let Some(mut parent) = plan.create_parent {
            // Re-creating over a soft-deleted row reuses its creation time;
            // created_at is never rewritten once a key has existed.
            let created_at = records
                .get(&rkey)
                .map(|old| old.parent.audit().created_at);
            *parent.audit_mut() = match created_at {
                Some(created_at) => AuditFields {
                    created_at,
                    updated_at: now,
                    deleted: false,
                },
                None => AuditFields::new_at(now),
            };
            records.insert(rkey.clone(), Composite::childless(parent));
            writes += 1;
        }

        let Some(composite) = records.get_mut(&rkey) else {
            return Err(Error::store(
                "apply",
                format!("{} {} has no stored parent for child writes", K::KIND, key),
            ));
        };

        if let Some(mut parent) = plan.update_parent {
            parent.audit_mut().touch(now);
            parent.audit_mut().deleted = false;
            composite.parent = parent;
            writes += 1;
        }

        for nkey in &plan.delete_children {
            let before = composite.children.len();
            composite.children.retain(|c| &K::child_key(c) != nkey);
            writes += (before - composite.children.len()) as u64;
        }

        for mut child in plan.update_children {
            child.audit_mut().touch(now);
            let nkey = K::child_key(&child);
            match composite
                .children
                .iter_mut()
                .find(|c| K::child_key(c) == nkey)
            {
                Some(existing) => *existing = child,
                // An update for a row a concurrent retry already dropped
                // degrades to an insert; re-application stays convergent.
                None => composite.children.push(child),
            }
            writes += 1;
        }

        for mut child in plan.insert_children {
            *child.audit_mut() = AuditFields::new_at(now);
            let nkey = K::child_key(&child);
            match composite
                .children
                .iter_mut()
                .find(|c| K::child_key(c) == nkey)
            {
                Some(existing) => *existing = child,
                None => composite.children.push(child),
            }
            writes += 1;
        }

        if plan.delete_parent {
            records.remove(&rkey);
            writes += 1;
        }

        drop(records);
        self.bump(writes);
        debug!(kind = K::KIND, %key, writes, "merge plan applied");
        Ok(())
    }

    async fn remove(&self, cluster: &str, key: &ObjectKey) -> Result<()> {
        let now = Utc::now();
        let mut records = self.write();
        let rkey = record_key(cluster, key);
        let writes = match K::DELETE {
            DeletePolicy::Hard => match records.remove(&rkey) {
                Some(_) => 1,
                None => 0,
            },
            DeletePolicy::Soft => match records.get_mut(&rkey) {
                Some(composite) if !composite.parent.audit().deleted => {
                    composite.parent.audit_mut().mark_deleted(now);
                    composite.children.clear();
                    1
                }
                _ => 0,
            },
        };
        drop(records);
        self.bump(writes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::plan;

    #[derive(Debug, Clone, PartialEq)]
    struct Parent {
        name: String,
        value: String,
        audit: AuditFields,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Child {
        key: String,
        value: String,
        audit: AuditFields,
    }

    impl Audited for Parent {
        fn audit(&self) -> &AuditFields {
            &self.audit
        }
        fn audit_mut(&mut self) -> &mut AuditFields {
            &mut self.audit
        }
    }

    impl Audited for Child {
        fn audit(&self) -> &AuditFields {
            &self.audit
        }
        fn audit_mut(&mut self) -> &mut AuditFields {
            &mut self.audit
        }
    }

    struct HardKind;
    impl CompositeKind for HardKind {
        type Parent = Parent;
        type Child = Child;
        const KIND: &'static str = "hard";

        fn child_key(child: &Child) -> String {
            child.key.clone()
        }
        fn parent_changed(stored: &Parent, observed: &Parent) -> bool {
            stored.value != observed.value
        }
        fn child_changed(stored: &Child, observed: &Child) -> bool {
            stored.value != observed.value
        }
        fn merge_parent(stored: &Parent, observed: &Parent) -> Parent {
            Parent {
                name: stored.name.clone(),
                value: observed.value.clone(),
                audit: stored.audit.clone(),
            }
        }
        fn merge_child(stored: &Child, observed: &Child) -> Child {
            Child {
                key: stored.key.clone(),
                value: observed.value.clone(),
                audit: stored.audit.clone(),
            }
        }
    }

    struct SoftKind;
    impl CompositeKind for SoftKind {
        type Parent = Parent;
        type Child = Child;
        const KIND: &'static str = "soft";
        const DELETE: DeletePolicy = DeletePolicy::Soft;

        fn child_key(child: &Child) -> String {
            child.key.clone()
        }
        fn parent_changed(stored: &Parent, observed: &Parent) -> bool {
            stored.value != observed.value
        }
        fn child_changed(stored: &Child, observed: &Child) -> bool {
            stored.value != observed.value
        }
        fn merge_parent(stored: &Parent, observed: &Parent) -> Parent {
            HardKind::merge_parent(stored, observed)
        }
        fn merge_child(stored: &Child, observed: &Child) -> Child {
            HardKind::merge_child(stored, observed)
        }
    }

    fn parent(value: &str) -> Parent {
        Parent {
            name: "web".to_string(),
            value: value.to_string(),
            audit: AuditFields::now(),
        }
    }

    fn child(key: &str, value: &str) -> Child {
        Child {
            key: key.to_string(),
            value: value.to_string(),
            audit: AuditFields::now(),
        }
    }

    fn observed(value: &str, children: Vec<Child>) -> Composite<Parent, Child> {
        Composite {
            parent: parent(value),
            children,
        }
    }

    #[tokio::test]
    async fn test_create_then_identical_resync_writes_nothing() {
        let store = MemoryStore::<HardKind>::new();
        let key = ObjectKey::namespaced("default", "web");
        let obs = observed("v1", vec![child("a", "x")]);

        let p = plan::<HardKind>(None, &obs);
        store.apply("c1", &key, p).await.unwrap();
        let after_first = store.write_count();
        assert_eq!(after_first, 2);

        // Second sync of an unchanged object plans nothing and writes nothing.
        let stored = store.load("c1", &key).await.unwrap();
        let p = plan::<HardKind>(stored.as_ref(), &obs);
        assert!(p.is_noop());
        store.apply("c1", &key, p).await.unwrap();
        assert_eq!(store.write_count(), after_first);
    }

    #[tokio::test]
    async fn test_update_refreshes_updated_at_only() {
        let store = MemoryStore::<HardKind>::new();
        let key = ObjectKey::namespaced("default", "web");
        store
            .apply("c1", &key, plan::<HardKind>(None, &observed("v1", vec![])))
            .await
            .unwrap();
        let created = store.peek("c1", &key).unwrap().parent.audit.created_at;

        let stored = store.load("c1", &key).await.unwrap();
        store
            .apply(
                "c1",
                &key,
                plan::<HardKind>(stored.as_ref(), &observed("v2", vec![])),
            )
            .await
            .unwrap();

        let after = store.peek("c1", &key).unwrap().parent;
        assert_eq!(after.value, "v2");
        assert_eq!(after.audit.created_at, created);
        assert!(after.audit.updated_at >= created);
    }

    #[tokio::test]
    async fn test_hard_remove_is_idempotent() {
        let store = MemoryStore::<HardKind>::new();
        let key = ObjectKey::namespaced("default", "web");
        store
            .apply("c1", &key, plan::<HardKind>(None, &observed("v1", vec![])))
            .await
            .unwrap();

        store.remove("c1", &key).await.unwrap();
        assert!(store.load("c1", &key).await.unwrap().is_none());
        let writes = store.write_count();

        // Removing the already-absent record is a no-op, not an error.
        store.remove("c1", &key).await.unwrap();
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn test_soft_remove_marks_deleted_and_hides_from_load() {
        let store = MemoryStore::<SoftKind>::new();
        let key = ObjectKey::cluster_scoped("ns1");
        store
            .apply("c1", &key, plan::<SoftKind>(None, &observed("v1", vec![])))
            .await
            .unwrap();

        store.remove("c1", &key).await.unwrap();
        assert!(store.load("c1", &key).await.unwrap().is_none());
        let peeked = store.peek("c1", &key).unwrap();
        assert!(peeked.parent.audit.deleted);

        let writes = store.write_count();
        store.remove("c1", &key).await.unwrap();
        assert_eq!(store.write_count(), writes, "second soft delete is a no-op");
    }

    #[tokio::test]
    async fn test_recreate_after_soft_delete_preserves_created_at() {
        let store = MemoryStore::<SoftKind>::new();
        let key = ObjectKey::cluster_scoped("ns1");
        store
            .apply("c1", &key, plan::<SoftKind>(None, &observed("v1", vec![])))
            .await
            .unwrap();
        let created = store.peek("c1", &key).unwrap().parent.audit.created_at;

        store.remove("c1", &key).await.unwrap();

        // Live object reappears: load sees nothing, so the plan re-creates.
        let stored = store.load("c1", &key).await.unwrap();
        assert!(stored.is_none());
        store
            .apply(
                "c1",
                &key,
                plan::<SoftKind>(stored.as_ref(), &observed("v2", vec![])),
            )
            .await
            .unwrap();

        let after = store.peek("c1", &key).unwrap().parent;
        assert!(!after.audit.deleted);
        assert_eq!(after.value, "v2");
        assert_eq!(after.audit.created_at, created);
    }

    #[tokio::test]
    async fn test_child_writes_without_parent_are_rejected() {
        let store = MemoryStore::<HardKind>::new();
        let key = ObjectKey::namespaced("default", "web");
        let plan = MergePlan {
            insert_children: vec![child("a", "x")],
            ..Default::default()
        };
        assert!(store.apply("c1", &key, plan).await.is_err());
    }

    #[tokio::test]
    async fn test_advisory_lock_serializes_holders() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::time::Duration;

        let locks = Arc::new(AdvisoryLocks::new());
        let concurrent = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let locks = Arc::clone(&locks);
            let concurrent = Arc::clone(&concurrent);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("app/default/web").await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
