//! Service mirror: one parent row plus one child row per named port
//!
//! Child natural key is the port name. A service may legitimately hold zero
//! ports transiently, so an empty parent is retained rather than cascaded.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};

use tain_common::{AuditFields, Audited, ObjectKey};
use tain_sync::{Composite, CompositeKind, DeletePolicy};

use crate::mirror::MirrorKind;

/// Mirrored service row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Cluster identity
    pub cluster: String,
    /// Namespace of the live object
    pub namespace: String,
    /// Name of the live object
    pub name: String,
    /// Server-assigned UID of the live object
    pub uid: String,
    /// Service type (ClusterIP, NodePort, LoadBalancer, ExternalName)
    pub service_type: String,
    /// Assigned cluster IP, empty for headless services
    pub cluster_ip: String,
    /// Pod selector
    pub selector: BTreeMap<String, String>,
    /// Object labels
    pub labels: BTreeMap<String, String>,
    /// Row audit fields
    pub audit: AuditFields,
}

/// Mirrored service port row, owned by a [`ServiceRecord`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePortRecord {
    /// Cluster identity, matches the parent
    pub cluster: String,
    /// Namespace, matches the parent
    pub namespace: String,
    /// Parent service name (identity tuple, not a live reference)
    pub service: String,
    /// Port name; natural key within the parent
    pub port_name: String,
    /// Protocol (TCP, UDP, SCTP)
    pub protocol: String,
    /// Exposed port
    pub port: i32,
    /// Target port as rendered text (number or named port)
    pub target_port: String,
    /// Node port if allocated
    pub node_port: Option<i32>,
    /// Row audit fields
    pub audit: AuditFields,
}

impl Audited for ServiceRecord {
    fn audit(&self) -> &AuditFields {
        &self.audit
    }
    fn audit_mut(&mut self) -> &mut AuditFields {
        &mut self.audit
    }
}

impl Audited for ServicePortRecord {
    fn audit(&self) -> &AuditFields {
        &self.audit
    }
    fn audit_mut(&mut self) -> &mut AuditFields {
        &mut self.audit
    }
}

/// Diff-merge parameterization for services
pub struct ServiceKind;

impl CompositeKind for ServiceKind {
    type Parent = ServiceRecord;
    type Child = ServicePortRecord;
    const KIND: &'static str = "service";
    const DELETE: DeletePolicy = DeletePolicy::Hard;

    fn child_key(child: &ServicePortRecord) -> String {
        child.port_name.clone()
    }

    fn parent_changed(stored: &ServiceRecord, observed: &ServiceRecord) -> bool {
        stored.uid != observed.uid
            || stored.service_type != observed.service_type
            || stored.cluster_ip != observed.cluster_ip
            || stored.selector != observed.selector
            || stored.labels != observed.labels
    }

    fn child_changed(stored: &ServicePortRecord, observed: &ServicePortRecord) -> bool {
        stored.protocol != observed.protocol
            || stored.port != observed.port
            || stored.target_port != observed.target_port
            || stored.node_port != observed.node_port
    }

    fn merge_parent(stored: &ServiceRecord, observed: &ServiceRecord) -> ServiceRecord {
        ServiceRecord {
            cluster: stored.cluster.clone(),
            namespace: stored.namespace.clone(),
            name: stored.name.clone(),
            audit: stored.audit.clone(),
            ..observed.clone()
        }
    }

    fn merge_child(stored: &ServicePortRecord, observed: &ServicePortRecord) -> ServicePortRecord {
        ServicePortRecord {
            cluster: stored.cluster.clone(),
            namespace: stored.namespace.clone(),
            service: stored.service.clone(),
            port_name: stored.port_name.clone(),
            audit: stored.audit.clone(),
            ..observed.clone()
        }
    }
}

impl MirrorKind for ServiceKind {
    type Object = Service;
    const CONTROLLER: &'static str = "service";

    fn observe(
        cluster: &str,
        key: &ObjectKey,
        obj: &Service,
    ) -> Composite<ServiceRecord, ServicePortRecord> {
        let meta = &obj.metadata;
        let spec = obj.spec.clone().unwrap_or_default();
        let namespace = key.namespace_or_default().to_string();

        let parent = ServiceRecord {
            cluster: cluster.to_string(),
            namespace: namespace.clone(),
            name: key.name.clone(),
            uid: meta.uid.clone().unwrap_or_default(),
            service_type: spec.type_.unwrap_or_else(|| "ClusterIP".to_string()),
            cluster_ip: spec.cluster_ip.unwrap_or_default(),
            selector: spec.selector.unwrap_or_default(),
            labels: meta.labels.clone().unwrap_or_default(),
            audit: AuditFields::now(),
        };

        let children = spec
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|p| ServicePortRecord {
                cluster: cluster.to_string(),
                namespace: namespace.clone(),
                service: key.name.clone(),
                // An unnamed port is only legal on single-port services; key
                // it by its number so the natural key stays stable.
                port_name: p.name.unwrap_or_else(|| p.port.to_string()),
                protocol: p.protocol.unwrap_or_else(|| "TCP".to_string()),
                port: p.port,
                target_port: p
                    .target_port
                    .map(render_target_port)
                    .unwrap_or_else(|| p.port.to_string()),
                node_port: p.node_port,
                audit: AuditFields::now(),
            })
            .collect();

        Composite { parent, children }
    }
}

fn render_target_port(target: IntOrString) -> String {
    match target {
        IntOrString::Int(n) => n.to_string(),
        IntOrString::String(s) => s,
    }
}
