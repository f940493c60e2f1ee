//! Ingress mirror: one parent row plus one child row per routing rule
//!
//! Child natural key is host plus normalized root path. An ingress whose last
//! rule disappears routes nothing, so the parent row is cascade-deleted with
//! its final child.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::Ingress;
use serde::{Deserialize, Serialize};

use tain_common::{AuditFields, Audited, ObjectKey};
use tain_sync::{Composite, CompositeKind, DeletePolicy};

use crate::mirror::MirrorKind;

/// Mirrored ingress row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressRecord {
    /// Cluster identity
    pub cluster: String,
    /// Namespace of the live object
    pub namespace: String,
    /// Name of the live object
    pub name: String,
    /// Server-assigned UID of the live object
    pub uid: String,
    /// Ingress class, if set
    pub ingress_class: Option<String>,
    /// Object labels
    pub labels: BTreeMap<String, String>,
    /// Row audit fields
    pub audit: AuditFields,
}

/// Mirrored routing-rule row, owned by an [`IngressRecord`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressRuleRecord {
    /// Cluster identity, matches the parent
    pub cluster: String,
    /// Namespace, matches the parent
    pub namespace: String,
    /// Parent ingress name (identity tuple, not a live reference)
    pub ingress: String,
    /// Rule host; empty means any host
    pub host: String,
    /// Normalized path; natural key together with host
    pub path: String,
    /// Path match type (Prefix, Exact, ImplementationSpecific)
    pub path_type: String,
    /// Backend service name
    pub service_name: String,
    /// Backend service port, rendered as text (number or name)
    pub service_port: String,
    /// Row audit fields
    pub audit: AuditFields,
}

impl Audited for IngressRecord {
    fn audit(&self) -> &AuditFields {
        &self.audit
    }
    fn audit_mut(&mut self) -> &mut AuditFields {
        &mut self.audit
    }
}

impl Audited for IngressRuleRecord {
    fn audit(&self) -> &AuditFields {
        &self.audit
    }
    fn audit_mut(&mut self) -> &mut AuditFields {
        &mut self.audit
    }
}

/// Normalize a rule path for natural-key comparison
///
/// Empty and missing paths mean the root; everything is anchored with a
/// leading slash and trailing slashes are trimmed (except the root itself).
pub fn normalize_path(path: Option<&str>) -> String {
    let path = path.unwrap_or("").trim();
    if path.is_empty() || path == "/" {
        return "/".to_string();
    }
    let anchored = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    anchored.trim_end_matches('/').to_string()
}

/// Diff-merge parameterization for ingresses
pub struct IngressKind;

impl CompositeKind for IngressKind {
    type Parent = IngressRecord;
    type Child = IngressRuleRecord;
    const KIND: &'static str = "ingress";
    const CASCADE_ON_EMPTY: bool = true;
    const DELETE: DeletePolicy = DeletePolicy::Hard;

    fn child_key(child: &IngressRuleRecord) -> String {
        format!("{}{}", child.host, child.path)
    }

    fn parent_changed(stored: &IngressRecord, observed: &IngressRecord) -> bool {
        stored.uid != observed.uid
            || stored.ingress_class != observed.ingress_class
            || stored.labels != observed.labels
    }

    fn child_changed(stored: &IngressRuleRecord, observed: &IngressRuleRecord) -> bool {
        stored.path_type != observed.path_type
            || stored.service_name != observed.service_name
            || stored.service_port != observed.service_port
    }

    fn merge_parent(stored: &IngressRecord, observed: &IngressRecord) -> IngressRecord {
        IngressRecord {
            cluster: stored.cluster.clone(),
            namespace: stored.namespace.clone(),
            name: stored.name.clone(),
            audit: stored.audit.clone(),
            ..observed.clone()
        }
    }

    fn merge_child(stored: &IngressRuleRecord, observed: &IngressRuleRecord) -> IngressRuleRecord {
        IngressRuleRecord {
            cluster: stored.cluster.clone(),
            namespace: stored.namespace.clone(),
            ingress: stored.ingress.clone(),
            host: stored.host.clone(),
            path: stored.path.clone(),
            audit: stored.audit.clone(),
            ..observed.clone()
        }
    }
}

impl MirrorKind for IngressKind {
    type Object = Ingress;
    const CONTROLLER: &'static str = "ingress";

    fn observe(
        cluster: &str,
        key: &ObjectKey,
        obj: &Ingress,
    ) -> Composite<IngressRecord, IngressRuleRecord> {
        let meta = &obj.metadata;
        let spec = obj.spec.clone().unwrap_or_default();
        let namespace = key.namespace_or_default().to_string();

        let parent = IngressRecord {
            cluster: cluster.to_string(),
            namespace: namespace.clone(),
            name: key.name.clone(),
            uid: meta.uid.clone().unwrap_or_default(),
            ingress_class: spec.ingress_class_name,
            labels: meta.labels.clone().unwrap_or_default(),
            audit: AuditFields::now(),
        };

        let mut children = Vec::new();
        for rule in spec.rules.unwrap_or_default() {
            let host = rule.host.unwrap_or_default();
            let Some(http) = rule.http else { continue };
            for path in http.paths {
                let service = path.backend.service;
                let (service_name, service_port) = match service {
                    Some(svc) => {
                        let port = svc
                            .port
                            .map(|p| match (p.number, p.name) {
                                (Some(n), _) => n.to_string(),
                                (None, Some(name)) => name,
                                (None, None) => String::new(),
                            })
                            .unwrap_or_default();
                        (svc.name, port)
                    }
                    None => (String::new(), String::new()),
                };
                children.push(IngressRuleRecord {
                    cluster: cluster.to_string(),
                    namespace: namespace.clone(),
                    ingress: key.name.clone(),
                    host: host.clone(),
                    path: normalize_path(path.path.as_deref()),
                    path_type: path.path_type,
                    service_name,
                    service_port,
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
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule, IngressServiceBackend,
        IngressSpec, ServiceBackendPort,
    };
    use kube::api::ObjectMeta;
    use kube::runtime::watcher;
    use std::sync::Arc;
    use tain_common::NamespaceFilter;
    use tain_sync::watch::WatchCache;
    use tain_sync::{plan, MemoryStore, SyncHandler};

    use crate::mirror::Mirror;

    fn rule(host: &str, path: &str, service: &str, port: i32) -> IngressRule {
        IngressRule {
            host: Some(host.to_string()),
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some(path.to_string()),
                    path_type: "Prefix".to_string(),
                    backend: IngressBackend {
                        service: Some(IngressServiceBackend {
                            name: service.to_string(),
                            port: Some(ServiceBackendPort {
                                number: Some(port),
                                ..Default::default()
                            }),
                        }),
                        ..Default::default()
                    },
                }],
            }),
        }
    }

    fn ingress(rv: &str, rules: Vec<IngressRule>) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some(rv.to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(rules),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn key() -> ObjectKey {
        ObjectKey::namespaced("default", "web")
    }

    #[test]
    fn test_path_normalization() {
        assert_eq!(normalize_path(None), "/");
        assert_eq!(normalize_path(Some("")), "/");
        assert_eq!(normalize_path(Some("/")), "/");
        assert_eq!(normalize_path(Some("/api/")), "/api");
        assert_eq!(normalize_path(Some("api")), "/api");
        assert_eq!(normalize_path(Some("/api/v1")), "/api/v1");
    }

    #[test]
    fn test_observe_flattens_rules() {
        let obj = ingress(
            "1",
            vec![
                rule("a.example.com", "", "svc-a", 80),
                rule("b.example.com", "/api/", "svc-b", 8080),
            ],
        );
        let composite = IngressKind::observe("c1", &key(), &obj);
        assert_eq!(composite.children.len(), 2);
        assert_eq!(composite.children[0].path, "/");
        assert_eq!(composite.children[1].path, "/api");
        assert_eq!(composite.children[1].service_port, "8080");
        assert_eq!(
            IngressKind::child_key(&composite.children[1]),
            "b.example.com/api"
        );
    }

    /// Equivalent paths normalize to the same natural key, so a cosmetic
    /// rewrite of "/api/" to "/api" is not a rule replacement.
    #[test]
    fn test_equivalent_paths_share_natural_key() {
        let stored = IngressKind::observe("c1", &key(), &ingress("1", vec![rule("h", "/api/", "svc", 80)]));
        let observed = IngressKind::observe("c1", &key(), &ingress("2", vec![rule("h", "/api", "svc", 80)]));
        let merge = plan::<IngressKind>(Some(&stored), &observed);
        assert!(merge.is_noop());
    }

    /// The cascade example: the last rule disappearing deletes both the rule
    /// row and the parent row.
    #[tokio::test]
    async fn test_last_rule_cascades_parent_deletion() {
        let cache = Arc::new(WatchCache::<Ingress>::new());
        let store = Arc::new(MemoryStore::<IngressKind>::new());
        let mirror = Mirror::<IngressKind>::new(
            "c1",
            NamespaceFilter::allow_all(),
            Arc::clone(&cache),
            store.clone(),
        );

        cache.ingest(watcher::Event::Apply(ingress(
            "1",
            vec![rule("a.example.com", "/", "svc-a", 80)],
        )));
        mirror.sync(&key()).await.unwrap();
        assert_eq!(store.len(), 1);

        // All rules removed: parent goes too.
        cache.ingest(watcher::Event::Apply(ingress("2", vec![])));
        mirror.sync(&key()).await.unwrap();
        assert!(store.is_empty());

        // Re-syncing the now-empty ingress plans nothing.
        let writes = store.write_count();
        mirror.sync(&key()).await.unwrap();
        assert_eq!(store.write_count(), writes);
    }

    #[test]
    fn test_rule_backend_change_is_one_update() {
        let stored = IngressKind::observe("c1", &key(), &ingress("1", vec![rule("h", "/", "svc-a", 80)]));
        let observed = IngressKind::observe("c1", &key(), &ingress("2", vec![rule("h", "/", "svc-b", 80)]));
        let merge = plan::<IngressKind>(Some(&stored), &observed);
        assert_eq!(merge.update_children.len(), 1);
        assert_eq!(merge.update_children[0].service_name, "svc-b");
        assert!(merge.insert_children.is_empty());
        assert!(merge.delete_children.is_empty());
    }
}
