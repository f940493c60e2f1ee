//! Per-kind relational mirrors for tain
//!
//! One module per mirrored resource kind, each supplying its row types, its
//! diff-merge parameterization, and its conversion from the live object. The
//! kinds with owned child rows:
//!
//! - [`service`] - ports, keyed by port name; empty parent retained
//! - [`endpoints`] - addresses, keyed by IP plus node; empty parent retained
//! - [`ingress`] - routing rules, keyed by host plus normalized path; parent
//!   cascade-deleted with its last rule
//!
//! The parent-only kinds: [`secret`], [`namespace`], [`node`],
//! [`application`] (CRD-backed, with label write-back), [`event`].
//!
//! [`default_registry`] assembles the controller registry every cluster
//! supervisor starts from, with store handles injected explicitly.

#![deny(missing_docs)]

pub mod application;
pub mod crd;
pub mod endpoints;
pub mod event;
pub mod ingress;
pub mod mirror;
pub mod namespace;
pub mod node;
pub mod secret;
pub mod service;

use std::sync::Arc;

use tain_sync::store::{AdvisoryLocks, CompositeStore, MemoryStore};
use tain_sync::ControllerRegistry;

use application::{ApplicationKind, ApplicationMirror, KubeLabelWriter};
use endpoints::EndpointsKind;
use event::EventKind;
use ingress::IngressKind;
use mirror::{registry_entry, registry_entry_with};
use namespace::NamespaceKind;
use node::NodeKind;
use secret::SecretKind;
use service::ServiceKind;

pub use crd::{Application, ApplicationSpec, ApplicationStatus};
pub use mirror::{Mirror, MirrorKind, NoChild};

/// Store handles for every mirrored kind, injected at construction time
///
/// The handles share one backing store in production; the split by kind keeps
/// each mirror typed and each test able to substitute a single fake.
#[derive(Clone)]
pub struct MirrorStores {
    /// Service composites
    pub services: Arc<dyn CompositeStore<ServiceKind>>,
    /// Endpoints composites
    pub endpoints: Arc<dyn CompositeStore<EndpointsKind>>,
    /// Ingress composites
    pub ingresses: Arc<dyn CompositeStore<IngressKind>>,
    /// Secret records
    pub secrets: Arc<dyn CompositeStore<SecretKind>>,
    /// Namespace records
    pub namespaces: Arc<dyn CompositeStore<NamespaceKind>>,
    /// Node records
    pub nodes: Arc<dyn CompositeStore<NodeKind>>,
    /// Application records
    pub applications: Arc<dyn CompositeStore<ApplicationKind>>,
    /// Event records
    pub events: Arc<dyn CompositeStore<EventKind>>,
    /// Named advisory locks shared across sync paths
    pub locks: Arc<AdvisoryLocks>,
}

impl MirrorStores {
    /// In-memory stores for development mode and tests
    pub fn in_memory() -> Self {
        Self {
            services: Arc::new(MemoryStore::<ServiceKind>::new()),
            endpoints: Arc::new(MemoryStore::<EndpointsKind>::new()),
            ingresses: Arc::new(MemoryStore::<IngressKind>::new()),
            secrets: Arc::new(MemoryStore::<SecretKind>::new()),
            namespaces: Arc::new(MemoryStore::<NamespaceKind>::new()),
            nodes: Arc::new(MemoryStore::<NodeKind>::new()),
            applications: Arc::new(MemoryStore::<ApplicationKind>::new()),
            events: Arc::new(MemoryStore::<EventKind>::new()),
            locks: Arc::new(AdvisoryLocks::new()),
        }
    }
}

/// Build the registry of all mirror controllers
///
/// Consulted by every cluster supervisor, so each cluster runs the same
/// controller set. Adding a kind means one more `register` call.
pub fn default_registry(stores: &MirrorStores) -> ControllerRegistry {
    let mut registry = ControllerRegistry::new();
    registry.register("service", registry_entry::<ServiceKind>(stores.services.clone()));
    registry.register(
        "endpoints",
        registry_entry::<EndpointsKind>(stores.endpoints.clone()),
    );
    registry.register(
        "ingress",
        registry_entry::<IngressKind>(stores.ingresses.clone()),
    );
    registry.register("secret", registry_entry::<SecretKind>(stores.secrets.clone()));
    registry.register(
        "namespace",
        registry_entry::<NamespaceKind>(stores.namespaces.clone()),
    );
    registry.register("node", registry_entry::<NodeKind>(stores.nodes.clone()));

    let app_store = stores.applications.clone();
    let app_locks = stores.locks.clone();
    registry.register(
        "application",
        registry_entry_with("application", move |ctx, cache| {
            Arc::new(ApplicationMirror::new(
                ctx.cluster.clone(),
                ctx.filter.clone(),
                cache,
                app_store.clone(),
                app_locks.clone(),
                Arc::new(KubeLabelWriter::new(ctx.client.clone())),
            ))
        }),
    );

    registry.register("event", registry_entry::<EventKind>(stores.events.clone()));
    registry
}
