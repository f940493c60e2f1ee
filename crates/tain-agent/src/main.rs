//! tain agent - relational mirror of live Kubernetes cluster state
//!
//! One process mirrors any number of clusters. Per cluster the agent holds a
//! leader-election lease; while leading it runs the full registered
//! controller set (services, endpoints, ingresses, secrets, namespaces,
//! nodes, applications, events) against that cluster's watch streams and
//! writes composite records into the store.

mod runner;

use std::sync::Arc;

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio_util::sync::CancellationToken;

use tain_common::{telemetry, NamespaceFilter, TAIN_SYSTEM_NAMESPACE};
use tain_mirrors::{default_registry, MirrorStores};
use tain_sync::{ClusterSupervisor, LeaseElector, LeaseTimings, SupervisorContext};

use runner::{default_identity, parse_cluster_arg, SupervisorFleet};

/// tain agent - mirrors live cluster object state into a relational store
#[derive(Parser, Debug)]
#[command(name = "tain-agent", version, about, long_about = None)]
struct Cli {
    /// Cluster to mirror as NAME or NAME=KUBECONFIG; repeatable.
    ///
    /// With no --cluster the agent mirrors the cluster it runs in (or the
    /// current kubeconfig context) under the name "local".
    #[arg(long = "cluster", value_name = "NAME[=KUBECONFIG]")]
    clusters: Vec<String>,

    /// Worker tasks per controller
    #[arg(long, default_value_t = 2, env = "TAIN_WORKERS")]
    workers: usize,

    /// Namespace to mirror; repeatable, empty means all namespaces
    #[arg(long = "namespace", value_name = "NAME")]
    namespaces: Vec<String>,

    /// Namespace holding the per-cluster election leases
    #[arg(long, default_value = TAIN_SYSTEM_NAMESPACE, env = "TAIN_LEASE_NAMESPACE")]
    lease_namespace: String,

    /// Lease holder identity; defaults to the pod/host name
    #[arg(long, env = "TAIN_IDENTITY")]
    identity: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();
    let cli = Cli::parse();

    let identity = cli.identity.unwrap_or_else(default_identity);
    let filter = if cli.namespaces.is_empty() {
        NamespaceFilter::allow_all()
    } else {
        NamespaceFilter::allow_only(cli.namespaces.clone())
    };

    // The persistent-store driver is wired in behind these handles; the
    // in-memory store backs single-binary development mode.
    let stores = MirrorStores::in_memory();
    let registry = Arc::new(default_registry(&stores));
    tracing::info!(
        identity = %identity,
        controllers = registry.len(),
        "tain agent starting"
    );

    let clusters: Vec<(String, Option<String>)> = if cli.clusters.is_empty() {
        vec![("local".to_string(), None)]
    } else {
        cli.clusters.iter().map(|c| parse_cluster_arg(c)).collect()
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let fleet = SupervisorFleet::new();
    for (cluster, kubeconfig) in clusters {
        let client = make_client(kubeconfig.as_deref())
            .await
            .map_err(|e| anyhow::anyhow!("failed to build client for {}: {}", cluster, e))?;

        let ctx = Arc::new(SupervisorContext {
            cluster: cluster.clone(),
            client: client.clone(),
            workers: cli.workers,
            filter: filter.clone(),
        });
        let elector = LeaseElector::new(
            client,
            cluster.clone(),
            cli.lease_namespace.clone(),
            identity.clone(),
            LeaseTimings::default(),
        );
        let supervisor = ClusterSupervisor::new(ctx, Arc::clone(&registry), Arc::new(elector));
        fleet.spawn(cluster, supervisor, shutdown.clone());
    }

    tracing::info!(clusters = fleet.len(), "all cluster supervisors started");
    fleet.join_all().await;
    tracing::info!("tain agent shutting down");
    Ok(())
}

/// Build a client for the in-cluster config, current context, or an explicit
/// kubeconfig path
async fn make_client(kubeconfig: Option<&str>) -> anyhow::Result<Client> {
    match kubeconfig {
        None => Ok(Client::try_default().await?),
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            let config =
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
            Ok(Client::try_from(config)?)
        }
    }
}
