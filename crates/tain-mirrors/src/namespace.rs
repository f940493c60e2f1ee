//! Namespace mirror: parent row only, soft-deleted
//!
//! Namespace rows are referenced by reporting queries long after the live
//! namespace is gone, so removal sets the deleted marker instead of dropping
//! the row.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use serde::{Deserialize, Serialize};

use tain_common::{AuditFields, Audited, ObjectKey};
use tain_sync::{Composite, CompositeKind, DeletePolicy};

use crate::mirror::{MirrorKind, NoChild};

/// Mirrored namespace row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceRecord {
    /// Cluster identity
    pub cluster: String,
    /// Name of the live object (cluster-scoped)
    pub name: String,
    /// Server-assigned UID of the live object
    pub uid: String,
    /// Lifecycle phase (Active, Terminating)
    pub phase: String,
    /// Object labels
    pub labels: BTreeMap<String, String>,
    /// Row audit fields
    pub audit: AuditFields,
}

impl Audited for NamespaceRecord {
    fn audit(&self) -> &AuditFields {
        &self.audit
    }
    fn audit_mut(&mut self) -> &mut AuditFields {
        &mut self.audit
    }
}

/// Diff-merge parameterization for namespaces
pub struct NamespaceKind;

impl CompositeKind for NamespaceKind {
    type Parent = NamespaceRecord;
    type Child = NoChild;
    const KIND: &'static str = "namespace";
    const DELETE: DeletePolicy = DeletePolicy::Soft;

    fn child_key(_child: &NoChild) -> String {
        String::new()
    }

    fn parent_changed(stored: &NamespaceRecord, observed: &NamespaceRecord) -> bool {
        stored.uid != observed.uid
            || stored.phase != observed.phase
            || stored.labels != observed.labels
    }

    fn child_changed(_stored: &NoChild, _observed: &NoChild) -> bool {
        false
    }

    fn merge_parent(stored: &NamespaceRecord, observed: &NamespaceRecord) -> NamespaceRecord {
        NamespaceRecord {
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

impl MirrorKind for NamespaceKind {
    type Object = Namespace;
    const CONTROLLER: &'static str = "namespace";

    fn observe(
        cluster: &str,
        key: &ObjectKey,
        obj: &Namespace,
    ) -> Composite<NamespaceRecord, NoChild> {
        let meta = &obj.metadata;
        Composite::childless(NamespaceRecord {
            cluster: cluster.to_string(),
            name: key.name.clone(),
            uid: meta.uid.clone().unwrap_or_default(),
            phase: obj
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_else(|| "Active".to_string()),
            labels: meta.labels.clone().unwrap_or_default(),
            audit: AuditFields::now(),
        })
    }
}
