//! Node mirror: parent row only, soft-deleted
//!
//! Node rows anchor capacity and event reporting, so removal sets the
//! deleted marker; a node that rejoins under the same name resurrects its
//! row.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;
use serde::{Deserialize, Serialize};

use tain_common::{AuditFields, Audited, ObjectKey};
use tain_sync::{Composite, CompositeKind, DeletePolicy};

use crate::mirror::{MirrorKind, NoChild};

/// Mirrored node row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Cluster identity
    pub cluster: String,
    /// Name of the live object (cluster-scoped)
    pub name: String,
    /// Server-assigned UID of the live object
    pub uid: String,
    /// First reported internal IP, empty when none
    pub internal_ip: String,
    /// Kubelet version from node info
    pub kubelet_version: String,
    /// OS image from node info
    pub os_image: String,
    /// CPU architecture from node info
    pub architecture: String,
    /// Pod CIDR assigned to the node
    pub pod_cidr: String,
    /// Whether the node is cordoned
    pub unschedulable: bool,
    /// Object labels
    pub labels: BTreeMap<String, String>,
    /// Row audit fields
    pub audit: AuditFields,
}

impl Audited for NodeRecord {
    fn audit(&self) -> &AuditFields {
        &self.audit
    }
    fn audit_mut(&mut self) -> &mut AuditFields {
        &mut self.audit
    }
}

/// Diff-merge parameterization for nodes
pub struct NodeKind;

impl CompositeKind for NodeKind {
    type Parent = NodeRecord;
    type Child = NoChild;
    const KIND: &'static str = "node";
    const DELETE: DeletePolicy = DeletePolicy::Soft;

    fn child_key(_child: &NoChild) -> String {
        String::new()
    }

    fn parent_changed(stored: &NodeRecord, observed: &NodeRecord) -> bool {
        stored.uid != observed.uid
            || stored.internal_ip != observed.internal_ip
            || stored.kubelet_version != observed.kubelet_version
            || stored.os_image != observed.os_image
            || stored.architecture != observed.architecture
            || stored.pod_cidr != observed.pod_cidr
            || stored.unschedulable != observed.unschedulable
            || stored.labels != observed.labels
    }

    fn child_changed(_stored: &NoChild, _observed: &NoChild) -> bool {
        false
    }

    fn merge_parent(stored: &NodeRecord, observed: &NodeRecord) -> NodeRecord {
        NodeRecord {
            cluster: stored.cluster.clone(),
            name: stored.name.clone(),
            audit: stored.audit.clone(),
            ..observed.clone()
        }
    }

    fn merge_child(stored: &NoChild, _observed: &NoChild) -> NoChild {
        stored.clone()
    }
}

impl MirrorKind for NodeKind {
    type Object = Node;
    const CONTROLLER: &'static str = "node";

    fn observe(cluster: &str, key: &ObjectKey, obj: &Node) -> Composite<NodeRecord, NoChild> {
        let meta = &obj.metadata;
        let spec = obj.spec.clone().unwrap_or_default();
        let status = obj.status.clone().unwrap_or_default();
        let info = status.node_info.unwrap_or_default();

        let internal_ip = status
            .addresses
            .unwrap_or_default()
            .into_iter()
            .find(|a| a.type_ == "InternalIP")
            .map(|a| a.address)
            .unwrap_or_default();

        Composite::childless(NodeRecord {
            cluster: cluster.to_string(),
            name: key.name.clone(),
            uid: meta.uid.clone().unwrap_or_default(),
            internal_ip,
            kubelet_version: info.kubelet_version,
            os_image: info.os_image,
            architecture: info.architecture,
            pod_cidr: spec.pod_cidr.unwrap_or_default(),
            unschedulable: spec.unschedulable.unwrap_or(false),
            labels: meta.labels.clone().unwrap_or_default(),
            audit: AuditFields::now(),
        })
    }
}
