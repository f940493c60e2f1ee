//! Supervisor fleet: one task per mirrored cluster
//!
//! Each cluster supervisor runs as an independent task tracked in a handle
//! table; all of them share the outer shutdown token wired to Ctrl-C.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tain_sync::ClusterSupervisor;

/// Handle table for the per-cluster supervisor tasks
#[derive(Default)]
pub struct SupervisorFleet {
    handles: DashMap<String, JoinHandle<()>>,
}

impl SupervisorFleet {
    /// Create an empty fleet
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn one cluster's supervisor under the shared shutdown token
    pub fn spawn(
        &self,
        cluster: impl Into<String>,
        supervisor: ClusterSupervisor,
        shutdown: CancellationToken,
    ) {
        let cluster = cluster.into();
        info!(cluster = %cluster, "starting cluster supervisor");
        let handle = tokio::spawn(async move {
            supervisor.run(shutdown).await;
        });
        self.handles.insert(cluster, handle);
    }

    /// Number of running supervisors
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the fleet is empty
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every supervisor to finish
    pub async fn join_all(self) {
        let keys: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        for cluster in keys {
            if let Some((_, handle)) = self.handles.remove(&cluster) {
                let _ = handle.await;
                info!(cluster = %cluster, "cluster supervisor stopped");
            }
        }
    }
}

/// Split a `NAME` or `NAME=KUBECONFIG` cluster argument
pub fn parse_cluster_arg(arg: &str) -> (String, Option<String>) {
    match arg.split_once('=') {
        Some((name, path)) => (name.to_string(), Some(path.to_string())),
        None => (arg.to_string(), None),
    }
}

/// Identity used for lease holder fields
///
/// Prefers the pod/host name so leases are attributable in `kubectl` output.
pub fn default_identity() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("tain-agent-{}", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cluster_arg_name_only() {
        assert_eq!(parse_cluster_arg("prod"), ("prod".to_string(), None));
    }

    #[test]
    fn test_parse_cluster_arg_with_kubeconfig() {
        assert_eq!(
            parse_cluster_arg("prod=/etc/tain/prod.kubeconfig"),
            (
                "prod".to_string(),
                Some("/etc/tain/prod.kubeconfig".to_string())
            )
        );
    }

    #[test]
    fn test_default_identity_is_nonempty() {
        assert!(!default_identity().is_empty());
    }
}
