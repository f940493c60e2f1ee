//! Event mirror: parent row only, hard-deleted
//!
//! Cluster events are short-lived and expire server-side; their rows are
//! removed outright when the live object goes away.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Event;
use serde::{Deserialize, Serialize};

use tain_common::{AuditFields, Audited, ObjectKey};
use tain_sync::{Composite, CompositeKind, DeletePolicy};

use crate::mirror::{MirrorKind, NoChild};

/// Mirrored event row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Cluster identity
    pub cluster: String,
    /// Namespace of the live object
    pub namespace: String,
    /// Name of the live object
    pub name: String,
    /// Server-assigned UID of the live object
    pub uid: String,
    /// Kind of the involved object (Pod, Node, ...)
    pub involved_kind: String,
    /// Name of the involved object
    pub involved_name: String,
    /// Machine-readable reason (e.g. BackOff, Scheduled)
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// Event type (Normal, Warning)
    pub event_type: String,
    /// Occurrence count
    pub count: i32,
    /// Last occurrence, when reported
    pub last_seen: Option<DateTime<Utc>>,
    /// Row audit fields
    pub audit: AuditFields,
}

impl Audited for EventRecord {
    fn audit(&self) -> &AuditFields {
        &self.audit
    }
    fn audit_mut(&mut self) -> &mut AuditFields {
        &mut self.audit
    }
}

/// Diff-merge parameterization for events
pub struct EventKind;

impl CompositeKind for EventKind {
    type Parent = EventRecord;
    type Child = NoChild;
    const KIND: &'static str = "event";
    const DELETE: DeletePolicy = DeletePolicy::Hard;

    fn child_key(_child: &NoChild) -> String {
        String::new()
    }

    fn parent_changed(stored: &EventRecord, observed: &EventRecord) -> bool {
        stored.uid != observed.uid
            || stored.reason != observed.reason
            || stored.message != observed.message
            || stored.event_type != observed.event_type
            || stored.count != observed.count
            || stored.last_seen != observed.last_seen
    }

    fn child_changed(_stored: &NoChild, _observed: &NoChild) -> bool {
        false
    }

    fn merge_parent(stored: &EventRecord, observed: &EventRecord) -> EventRecord {
        EventRecord {
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

impl MirrorKind for EventKind {
    type Object = Event;
    const CONTROLLER: &'static str = "event";

    fn observe(cluster: &str, key: &ObjectKey, obj: &Event) -> Composite<EventRecord, NoChild> {
        let meta = &obj.metadata;
        Composite::childless(EventRecord {
            cluster: cluster.to_string(),
            namespace: key.namespace_or_default().to_string(),
            name: key.name.clone(),
            uid: meta.uid.clone().unwrap_or_default(),
            involved_kind: obj.involved_object.kind.clone().unwrap_or_default(),
            involved_name: obj.involved_object.name.clone().unwrap_or_default(),
            reason: obj.reason.clone().unwrap_or_default(),
            message: obj.message.clone().unwrap_or_default(),
            event_type: obj.type_.clone().unwrap_or_default(),
            count: obj.count.unwrap_or(1),
            last_seen: obj.last_timestamp.as_ref().map(|t| t.0),
            audit: AuditFields::now(),
        })
    }
}
