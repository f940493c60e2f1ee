//! Endpoints mirror: one parent row plus one child row per backend address
//!
//! Child natural key is the address IP plus node identity. All backends of a
//! service may be momentarily unready, so an empty parent is retained.
//!
//! The address-update path works through an explicit update marker: the
//! marker is set only when the stored and observed rows are not equal, and
//! persistence is guarded by that same marker. Round-trip tests pin both
//! branches (a true no-op skips the write, a changed address persists).

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Endpoints;
use serde::{Deserialize, Serialize};

use tain_common::{AuditFields, Audited, ObjectKey};
use tain_sync::{Composite, CompositeKind, DeletePolicy};

use crate::mirror::MirrorKind;

/// Mirrored endpoints row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRecord {
    /// Cluster identity
    pub cluster: String,
    /// Namespace of the live object
    pub namespace: String,
    /// Name of the live object (matches its service)
    pub name: String,
    /// Server-assigned UID of the live object
    pub uid: String,
    /// Object labels
    pub labels: BTreeMap<String, String>,
    /// Row audit fields
    pub audit: AuditFields,
}

/// Mirrored backend-address row, owned by an [`EndpointRecord`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointAddressRecord {
    /// Cluster identity, matches the parent
    pub cluster: String,
    /// Namespace, matches the parent
    pub namespace: String,
    /// Parent endpoints name (identity tuple, not a live reference)
    pub endpoint: String,
    /// Backend IP; natural key together with the node
    pub ip: String,
    /// Node hosting the backend, empty when unknown
    pub node_name: String,
    /// Kind of the object backing this address (usually Pod)
    pub target_kind: String,
    /// Name of the object backing this address
    pub target_name: String,
    /// Row audit fields
    pub audit: AuditFields,
}

impl Audited for EndpointRecord {
    fn audit(&self) -> &AuditFields {
        &self.audit
    }
    fn audit_mut(&mut self) -> &mut AuditFields {
        &mut self.audit
    }
}

impl Audited for EndpointAddressRecord {
    fn audit(&self) -> &AuditFields {
        &self.audit
    }
    fn audit_mut(&mut self) -> &mut AuditFields {
        &mut self.audit
    }
}

/// Update marker for one stored/observed address pair
///
/// Set only when the two rows differ on mirrored fields; the persistence
/// call is guarded by the marker.
pub fn address_update_marker(
    stored: &EndpointAddressRecord,
    observed: &EndpointAddressRecord,
) -> bool {
    let mut changed = false;
    if stored.target_kind != observed.target_kind {
        changed = true;
    }
    if stored.target_name != observed.target_name {
        changed = true;
    }
    changed
}

/// Diff-merge parameterization for endpoints
pub struct EndpointsKind;

impl CompositeKind for EndpointsKind {
    type Parent = EndpointRecord;
    type Child = EndpointAddressRecord;
    const KIND: &'static str = "endpoints";
    const DELETE: DeletePolicy = DeletePolicy::Hard;

    fn child_key(child: &EndpointAddressRecord) -> String {
        format!("{}|{}", child.ip, child.node_name)
    }

    fn parent_changed(stored: &EndpointRecord, observed: &EndpointRecord) -> bool {
        stored.uid != observed.uid || stored.labels != observed.labels
    }

    fn child_changed(stored: &EndpointAddressRecord, observed: &EndpointAddressRecord) -> bool {
        address_update_marker(stored, observed)
    }

    fn merge_parent(stored: &EndpointRecord, observed: &EndpointRecord) -> EndpointRecord {
        EndpointRecord {
            cluster: stored.cluster.clone(),
            namespace: stored.namespace.clone(),
            name: stored.name.clone(),
            audit: stored.audit.clone(),
            ..observed.clone()
        }
    }

    fn merge_child(
        stored: &EndpointAddressRecord,
        observed: &EndpointAddressRecord,
    ) -> EndpointAddressRecord {
        EndpointAddressRecord {
            cluster: stored.cluster.clone(),
            namespace: stored.namespace.clone(),
            endpoint: stored.endpoint.clone(),
            ip: stored.ip.clone(),
            node_name: stored.node_name.clone(),
            audit: stored.audit.clone(),
            ..observed.clone()
        }
    }
}

impl MirrorKind for EndpointsKind {
    type Object = Endpoints;
    const CONTROLLER: &'static str = "endpoints";

    fn observe(
        cluster: &str,
        key: &ObjectKey,
        obj: &Endpoints,
    ) -> Composite<EndpointRecord, EndpointAddressRecord> {
        let meta = &obj.metadata;
        let namespace = key.namespace_or_default().to_string();

        let parent = EndpointRecord {
            cluster: cluster.to_string(),
            namespace: namespace.clone(),
            name: key.name.clone(),
            uid: meta.uid.clone().unwrap_or_default(),
            labels: meta.labels.clone().unwrap_or_default(),
            audit: AuditFields::now(),
        };

        let mut children = Vec::new();
        for subset in obj.subsets.clone().unwrap_or_default() {
            for address in subset.addresses.unwrap_or_default() {
                let (target_kind, target_name) = address
                    .target_ref
                    .map(|r| (r.kind.unwrap_or_default(), r.name.unwrap_or_default()))
                    .unwrap_or_default();
                children.push(EndpointAddressRecord {
                    cluster: cluster.to_string(),
                    namespace: namespace.clone(),
                    endpoint: key.name.clone(),
                    ip: address.ip,
                    node_name: address.node_name.unwrap_or_default(),
                    target_kind,
                    target_name,
                    audit: AuditFields::now(),
                });
            }
        }

        Composite { parent, children }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, ObjectReference};
    use kube::api::ObjectMeta;
    use kube::runtime::watcher;
    use std::sync::Arc;
    use tain_common::NamespaceFilter;
    use tain_sync::watch::WatchCache;
    use tain_sync::{plan, MemoryStore, SyncHandler};

    use crate::mirror::Mirror;

    fn address(ip: &str, node: &str, pod: &str) -> EndpointAddress {
        EndpointAddress {
            ip: ip.to_string(),
            node_name: Some(node.to_string()),
            target_ref: Some(ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some(pod.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn endpoints(rv: &str, addresses: Vec<EndpointAddress>) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some(rv.to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            subsets: Some(vec![EndpointSubset {
                addresses: Some(addresses),
                ..Default::default()
            }]),
        }
    }

    fn key() -> ObjectKey {
        ObjectKey::namespaced("default", "web")
    }

    #[test]
    fn test_natural_key_is_ip_plus_node() {
        let composite = EndpointsKind::observe(
            "c1",
            &key(),
            &endpoints("1", vec![address("10.1.0.5", "node-a", "web-1")]),
        );
        assert_eq!(
            EndpointsKind::child_key(&composite.children[0]),
            "10.1.0.5|node-a"
        );
    }

    /// Same IP on two nodes are distinct children, not one flapping row.
    #[test]
    fn test_same_ip_different_nodes_are_distinct() {
        let composite = EndpointsKind::observe(
            "c1",
            &key(),
            &endpoints(
                "1",
                vec![address("10.1.0.5", "node-a", "web-1"), address("10.1.0.5", "node-b", "web-2")],
            ),
        );
        let merge = plan::<EndpointsKind>(None, &composite);
        assert_eq!(merge.insert_children.len(), 2);
    }

    /// Round trip for the marker-guarded branch: a pod replacement on the
    /// same address persists exactly one child update.
    #[tokio::test]
    async fn test_changed_address_persists() {
        let cache = Arc::new(WatchCache::<Endpoints>::new());
        let store = Arc::new(MemoryStore::<EndpointsKind>::new());
        let mirror = Mirror::<EndpointsKind>::new(
            "c1",
            NamespaceFilter::allow_all(),
            Arc::clone(&cache),
            store.clone(),
        );

        cache.ingest(watcher::Event::Apply(endpoints(
            "1",
            vec![address("10.1.0.5", "node-a", "web-1")],
        )));
        mirror.sync(&key()).await.unwrap();
        let writes = store.write_count();

        // Same IP and node, different backing pod: the marker is set and the
        // row is rewritten.
        cache.ingest(watcher::Event::Apply(endpoints(
            "2",
            vec![address("10.1.0.5", "node-a", "web-2")],
        )));
        mirror.sync(&key()).await.unwrap();
        assert_eq!(store.write_count(), writes + 1);

        let stored = store.peek("c1", &key()).unwrap();
        assert_eq!(stored.children[0].target_name, "web-2");
    }

    /// Round trip for the no-op branch: identical content with a fresh
    /// version token sets no marker and writes nothing.
    #[tokio::test]
    async fn test_unchanged_address_skips_persistence() {
        let cache = Arc::new(WatchCache::<Endpoints>::new());
        let store = Arc::new(MemoryStore::<EndpointsKind>::new());
        let mirror = Mirror::<EndpointsKind>::new(
            "c1",
            NamespaceFilter::allow_all(),
            Arc::clone(&cache),
            store.clone(),
        );

        cache.ingest(watcher::Event::Apply(endpoints(
            "1",
            vec![address("10.1.0.5", "node-a", "web-1")],
        )));
        mirror.sync(&key()).await.unwrap();
        let writes = store.write_count();

        cache.ingest(watcher::Event::Apply(endpoints(
            "2",
            vec![address("10.1.0.5", "node-a", "web-1")],
        )));
        mirror.sync(&key()).await.unwrap();
        assert_eq!(store.write_count(), writes, "no-op change must not persist");
    }

    #[test]
    fn test_marker_branches() {
        let composite = EndpointsKind::observe(
            "c1",
            &key(),
            &endpoints("1", vec![address("10.1.0.5", "node-a", "web-1")]),
        );
        let stored = &composite.children[0];

        let mut same = stored.clone();
        same.audit = AuditFields::now();
        assert!(!address_update_marker(stored, &same));

        let mut changed = stored.clone();
        changed.target_name = "web-2".to_string();
        assert!(address_update_marker(stored, &changed));
    }

    /// Draining to zero addresses keeps the parent row.
    #[tokio::test]
    async fn test_empty_endpoints_retains_parent() {
        let cache = Arc::new(WatchCache::<Endpoints>::new());
        let store = Arc::new(MemoryStore::<EndpointsKind>::new());
        let mirror = Mirror::<EndpointsKind>::new(
            "c1",
            NamespaceFilter::allow_all(),
            Arc::clone(&cache),
            store.clone(),
        );

        cache.ingest(watcher::Event::Apply(endpoints(
            "1",
            vec![address("10.1.0.5", "node-a", "web-1")],
        )));
        mirror.sync(&key()).await.unwrap();

        cache.ingest(watcher::Event::Apply(endpoints("2", vec![])));
        mirror.sync(&key()).await.unwrap();

        let stored = store.peek("c1", &key()).unwrap();
        assert!(stored.children.is_empty());
        assert!(!stored.parent.audit.deleted);
    }
}
