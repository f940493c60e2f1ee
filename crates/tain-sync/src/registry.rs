//! Controller registry: name → start function, built once at initialization
//!
//! Every cluster supervisor consults the same registry, so the controller set
//! is uniform across clusters. The registry is an explicitly constructed
//! value passed by reference through supervisor construction — there is no
//! process-wide mutable table — which keeps one cluster's supervisor testable
//! in isolation.

use std::sync::Arc;

use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tain_common::{NamespaceFilter, Result};

/// Shared context handed to every controller start function
pub struct SupervisorContext {
    /// Identity of the mirrored cluster
    pub cluster: String,
    /// API client for the mirrored cluster
    pub client: Client,
    /// Worker tasks per controller
    pub workers: usize,
    /// Namespace allow-list applied by sync handlers
    pub filter: NamespaceFilter,
}

/// A controller start function
///
/// Returns an error if the controller cannot begin watching; the started task
/// halts when the stop token fires.
pub type StartFn =
    Box<dyn Fn(&Arc<SupervisorContext>, CancellationToken) -> Result<JoinHandle<()>> + Send + Sync>;

/// Immutable table of controller factories
///
/// Populated once before any supervisor starts; adding a resource kind means
/// registering one more factory.
#[derive(Default)]
pub struct ControllerRegistry {
    factories: Vec<(&'static str, StartFn)>,
}

impl ControllerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a controller factory under a name
    pub fn register(&mut self, name: &'static str, start: StartFn) {
        self.factories.push((name, start));
    }

    /// Names of all registered controllers, in registration order
    pub fn names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|(name, _)| *name).collect()
    }

    /// Number of registered controllers
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether no controllers are registered
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Start every registered controller with the given context and stop token
    ///
    /// Fails fast on the first factory error; the caller cancels the stop
    /// token to halt whatever already started.
    pub fn start_all(
        &self,
        ctx: &Arc<SupervisorContext>,
        stop: &CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::with_capacity(self.factories.len());
        for (name, start) in &self.factories {
            info!(cluster = %ctx.cluster, "- {} controller", name);
            handles.push(start(ctx, stop.child_token())?);
        }
        Ok(handles)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fixtures for registry and supervisor tests

    use super::*;
    use http::{Request, Response};
    use kube::client::Body;

    /// A client whose every request fails with 404; registry and supervisor
    /// tests never reach the API.
    pub fn stub_client() -> Client {
        let service = tower::service_fn(|_req: Request<Body>| async move {
            let response = Response::builder()
                .status(404)
                .body(Body::from(Vec::new()))
                .expect("static response");
            Ok::<_, std::convert::Infallible>(response)
        });
        Client::new(service, "default")
    }

    pub fn test_context(cluster: &str) -> Arc<SupervisorContext> {
        Arc::new(SupervisorContext {
            cluster: cluster.to_string(),
            client: stub_client(),
            workers: 1,
            filter: NamespaceFilter::allow_all(),
        })
    }
}
