//! Secret mirror: parent row only, content kept as a digest
//!
//! Secret payloads never land in the mirror; the row carries the key list
//! and a SHA-256 digest so consumers can detect rotation without reading
//! material.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use tain_common::{AuditFields, Audited, ObjectKey};
use tain_sync::{Composite, CompositeKind, DeletePolicy};

use crate::mirror::{MirrorKind, NoChild};

/// Mirrored secret row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretRecord {
    /// Cluster identity
    pub cluster: String,
    /// Namespace of the live object
    pub namespace: String,
    /// Name of the live object
    pub name: String,
    /// Server-assigned UID of the live object
    pub uid: String,
    /// Secret type (Opaque, kubernetes.io/tls, ...)
    pub secret_type: String,
    /// Sorted data keys; values are never mirrored
    pub data_keys: Vec<String>,
    /// SHA-256 over the sorted key/value pairs, hex encoded
    pub data_digest: String,
    /// Object labels
    pub labels: BTreeMap<String, String>,
    /// Row audit fields
    pub audit: AuditFields,
}

impl Audited for SecretRecord {
    fn audit(&self) -> &AuditFields {
        &self.audit
    }
    fn audit_mut(&mut self) -> &mut AuditFields {
        &mut self.audit
    }
}

/// Diff-merge parameterization for secrets
pub struct SecretKind;

impl CompositeKind for SecretKind {
    type Parent = SecretRecord;
    type Child = NoChild;
    const KIND: &'static str = "secret";
    const DELETE: DeletePolicy = DeletePolicy::Hard;

    fn child_key(_child: &NoChild) -> String {
        String::new()
    }

    fn parent_changed(stored: &SecretRecord, observed: &SecretRecord) -> bool {
        stored.uid != observed.uid
            || stored.secret_type != observed.secret_type
            || stored.data_keys != observed.data_keys
            || stored.data_digest != observed.data_digest
            || stored.labels != observed.labels
    }

    fn child_changed(_stored: &NoChild, _observed: &NoChild) -> bool {
        false
    }

    fn merge_parent(stored: &SecretRecord, observed: &SecretRecord) -> SecretRecord {
        SecretRecord {
            cluster: stored.cluster.clone(),
            namespace: stored.namespace.clone(),
            name: stored.name.clone(),
            audit: stored.audit.clone(),
            ..observed.clone()
        }
    }

    fn merge_child(stored: &NoChild, _observed: &NoChild) -> NoChild {
        stored.clone()
    }
}

impl MirrorKind for SecretKind {
    type Object = Secret;
    const CONTROLLER: &'static str = "secret";

    fn observe(cluster: &str, key: &ObjectKey, obj: &Secret) -> Composite<SecretRecord, NoChild> {
        let meta = &obj.metadata;
        let data = obj.data.clone().unwrap_or_default();

        let mut hasher = Sha256::new();
        let mut data_keys = Vec::with_capacity(data.len());
        // BTreeMap iteration is already key-sorted, so the digest is stable.
        for (k, v) in &data {
            hasher.update(k.as_bytes());
            hasher.update([0u8]);
            hasher.update(&v.0);
            hasher.update([0u8]);
            data_keys.push(k.clone());
        }

        Composite::childless(SecretRecord {
            cluster: cluster.to_string(),
            namespace: key.namespace_or_default().to_string(),
            name: key.name.clone(),
            uid: meta.uid.clone().unwrap_or_default(),
            secret_type: obj.type_.clone().unwrap_or_else(|| "Opaque".to_string()),
            data_keys,
            data_digest: format!("{:x}", hasher.finalize()),
            labels: meta.labels.clone().unwrap_or_default(),
            audit: AuditFields::now(),
        })
    }
}
