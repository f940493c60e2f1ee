//! Per-cluster leader election using coordination Leases
//!
//! One lease per mirrored cluster; only the holder runs that cluster's
//! controllers, so a redundant agent fleet has exactly one active reconciler
//! per cluster.
//!
//! # Atomicity
//!
//! Uses resourceVersion for compare-and-swap semantics. If the lease changes
//! between read and write, the update fails with 409 Conflict and we retry.
//! This prevents race conditions where two agents both think they acquired
//! leadership.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tain_common::{Error, Result, LEASE_NAME_PREFIX};

/// Field manager for lease writes
const FIELD_MANAGER: &str = "tain-agent";

/// Lease/renew/retry timing triple for one supervisor's election loop
#[derive(Debug, Clone)]
pub struct LeaseTimings {
    /// How long a lease is valid without renewal
    pub lease_duration: Duration,
    /// How often the holder renews
    pub renew_interval: Duration,
    /// How often a non-holder retries acquisition
    pub retry_interval: Duration,
}

impl Default for LeaseTimings {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            renew_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// What the elector should do given the current lease state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDecision {
    /// No lease exists; create it
    Create,
    /// We hold the lease; renew it
    Renew,
    /// The lease expired; take it over, bumping the transition count
    TakeOver {
        /// Prior transition count
        transitions: i32,
    },
    /// Another holder's lease is still valid; wait and retry
    Blocked,
}

/// Decide the next election step from an observed lease
///
/// Pure so the protocol branches are testable without an API server.
pub fn decide(
    existing: Option<&Lease>,
    identity: &str,
    lease_duration: Duration,
    now: DateTime<Utc>,
) -> LeaseDecision {
    let Some(lease) = existing else {
        return LeaseDecision::Create;
    };
    let spec = lease.spec.as_ref();
    let holder = spec.and_then(|s| s.holder_identity.as_deref());

    if holder == Some(identity) {
        return LeaseDecision::Renew;
    }

    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec
        .and_then(|s| s.lease_duration_seconds)
        .unwrap_or(lease_duration.as_secs() as i32);
    let is_expired = match (holder, renew_time) {
        // A lease with no holder was released; immediately acquirable.
        (None, _) => true,
        (_, Some(rt)) => now > rt.0 + chrono::Duration::seconds(duration_secs as i64),
        (_, None) => true,
    };

    if is_expired {
        let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
        LeaseDecision::TakeOver { transitions }
    } else {
        LeaseDecision::Blocked
    }
}

/// Exclusive-reconciler status for one cluster
///
/// The supervisor only knows this seam; the Lease-backed implementation is
/// [`LeaseElector`], and tests substitute scripted terms.
#[async_trait]
pub trait Leadership: Send + Sync + 'static {
    /// Block until leadership is acquired, returning the active term
    async fn acquire(&self) -> Result<Box<dyn LeadershipTerm>>;
}

/// One held term of leadership
#[async_trait]
pub trait LeadershipTerm: Send {
    /// Resolve when leadership is lost (renewal failed or lease taken over)
    async fn lost(&mut self);

    /// Release the lease for fast failover; call during graceful shutdown
    async fn release(&self);
}

struct Inner {
    client: Client,
    cluster: String,
    lease_name: String,
    namespace: String,
    identity: String,
    timings: LeaseTimings,
}

/// Lease-backed leader elector for one cluster
#[derive(Clone)]
pub struct LeaseElector {
    inner: Arc<Inner>,
}

impl LeaseElector {
    /// Create an elector for a cluster-scoped lock name
    ///
    /// The lease is named `tain-sync-<cluster>` in the given namespace.
    pub fn new(
        client: Client,
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        identity: impl Into<String>,
        timings: LeaseTimings,
    ) -> Self {
        let cluster = cluster.into();
        Self {
            inner: Arc::new(Inner {
                lease_name: format!("{}-{}", LEASE_NAME_PREFIX, cluster),
                client,
                cluster,
                namespace: namespace.into(),
                identity: identity.into(),
                timings,
            }),
        }
    }

    /// Try to acquire or renew the lease atomically
    ///
    /// Returns whether we hold the lease afterwards.
    async fn try_acquire_or_renew(&self) -> Result<bool> {
        let inner = &self.inner;
        let api: Api<Lease> = Api::namespaced(inner.client.clone(), &inner.namespace);
        let now = Utc::now();

        let existing = match api.get(&inner.lease_name).await {
            Ok(lease) => Some(lease),
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(e.into()),
        };

        match decide(
            existing.as_ref(),
            &inner.identity,
            inner.timings.lease_duration,
            now,
        ) {
            LeaseDecision::Create => self.create_lease(&api, now).await,
            LeaseDecision::Renew => {
                // Safe: Renew is only decided for Some(existing).
                let Some(existing) = existing else {
                    return Ok(false);
                };
                self.renew_lease(&api, &existing, now).await
            }
            LeaseDecision::TakeOver { transitions } => {
                let resource_version =
                    existing.and_then(|l| l.metadata.resource_version.clone());
                self.take_over_lease(&api, resource_version, now, transitions)
                    .await
            }
            LeaseDecision::Blocked => Ok(false),
        }
    }

    /// Create a new lease (first leader)
    async fn create_lease(&self, api: &Api<Lease>, now: DateTime<Utc>) -> Result<bool> {
        let inner = &self.inner;
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(inner.lease_name.clone()),
                namespace: Some(inner.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(inner.identity.clone()),
                lease_duration_seconds: Some(inner.timings.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(cluster = %inner.cluster, identity = %inner.identity, "created new lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                // Someone else created it first - not an error, just retry
                debug!(cluster = %inner.cluster, "lease creation conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Renew an existing lease that we hold (atomic with resourceVersion)
    async fn renew_lease(
        &self,
        api: &Api<Lease>,
        existing: &Lease,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let inner = &self.inner;
        if existing.metadata.resource_version.is_none() {
            return Err(Error::election(
                &inner.cluster,
                "lease missing resourceVersion",
            ));
        }

        let mut updated = existing.clone();
        if let Some(ref mut spec) = updated.spec {
            spec.renew_time = Some(MicroTime(now));
        }

        match api
            .replace(&inner.lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => {
                debug!(cluster = %inner.cluster, "lease renewed");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                warn!(cluster = %inner.cluster, "lease renewal conflict - lost leadership");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Take over an expired lease (atomic with resourceVersion)
    async fn take_over_lease(
        &self,
        api: &Api<Lease>,
        resource_version: Option<String>,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Result<bool> {
        let inner = &self.inner;
        let rv = resource_version
            .ok_or_else(|| Error::election(&inner.cluster, "lease missing resourceVersion"))?;

        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(inner.lease_name.clone()),
                namespace: Some(inner.namespace.clone()),
                resource_version: Some(rv),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(inner.identity.clone()),
                lease_duration_seconds: Some(inner.timings.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions + 1),
                ..Default::default()
            }),
        };

        match api
            .replace(&inner.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => {
                info!(
                    cluster = %inner.cluster,
                    identity = %inner.identity,
                    transitions = transitions + 1,
                    "took over expired lease"
                );
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(cluster = %inner.cluster, "lease takeover conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Renewal loop that runs while we hold leadership
    async fn renewal_loop(self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.inner.timings.renew_interval).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => {} // Still leader
                Ok(false) | Err(_) => {
                    warn!(
                        cluster = %self.inner.cluster,
                        identity = %self.inner.identity,
                        "leadership lost"
                    );
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Release the lease by clearing the holder identity
    ///
    /// Allows a standby to acquire leadership immediately instead of waiting
    /// for expiry.
    async fn release_lease(&self) -> Result<()> {
        let inner = &self.inner;
        let api: Api<Lease> = Api::namespaced(inner.client.clone(), &inner.namespace);

        let lease = match api.get(&inner.lease_name).await {
            Ok(l) => l,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(cluster = %inner.cluster, "lease not found, nothing to release");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(inner.identity.as_str()) {
            debug!(cluster = %inner.cluster, "not the lease holder, nothing to release");
            return Ok(());
        }

        // Clear the holder and back-date renew_time so it's immediately
        // acquirable.
        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": past.to_rfc3339()
            }
        });

        api.patch(
            &inner.lease_name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;

        info!(cluster = %inner.cluster, "lease released for fast failover");
        Ok(())
    }
}

#[async_trait]
impl Leadership for LeaseElector {
    async fn acquire(&self) -> Result<Box<dyn LeadershipTerm>> {
        let inner = &self.inner;
        info!(
            cluster = %inner.cluster,
            identity = %inner.identity,
            lease = %inner.lease_name,
            "waiting for leadership"
        );
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(cluster = %inner.cluster, identity = %inner.identity, "leadership acquired");
                    let (lost_tx, lost_rx) = oneshot::channel();
                    let renewal_task = tokio::spawn(self.clone().renewal_loop(lost_tx));
                    return Ok(Box::new(LeaseTerm {
                        elector: self.clone(),
                        renewal_task,
                        lost_rx: Some(lost_rx),
                    }));
                }
                Ok(false) => {
                    debug!(
                        cluster = %inner.cluster,
                        retry_secs = inner.timings.retry_interval.as_secs(),
                        "lease held by another, waiting"
                    );
                }
                Err(e) => {
                    // Transient API errors must not end the election loop
                    warn!(
                        cluster = %inner.cluster,
                        error = %e,
                        retry_secs = inner.timings.retry_interval.as_secs(),
                        "failed to acquire lease, retrying"
                    );
                }
            }
            tokio::time::sleep(inner.timings.retry_interval).await;
        }
    }
}

/// A held Lease-backed leadership term
///
/// The renewal task is aborted when the term is dropped.
pub struct LeaseTerm {
    elector: LeaseElector,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

#[async_trait]
impl LeadershipTerm for LeaseTerm {
    async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    async fn release(&self) {
        if let Err(e) = self.elector.release_lease().await {
            warn!(cluster = %self.elector.inner.cluster, error = %e, "failed to release lease");
        }
    }
}

impl Drop for LeaseTerm {
    fn drop(&mut self) {
        self.renewal_task.abort();
        debug!(cluster = %self.elector.inner.cluster, "leadership term ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const LEASE_SECS: u64 = 30;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn lease(holder: Option<&str>, renewed_secs_ago: i64, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some("tain-sync-prod".to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: holder.map(String::from),
                lease_duration_seconds: Some(LEASE_SECS as i32),
                renew_time: Some(MicroTime(now() - chrono::Duration::seconds(renewed_secs_ago))),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    fn duration() -> Duration {
        Duration::from_secs(LEASE_SECS)
    }

    #[test]
    fn test_missing_lease_is_created() {
        assert_eq!(decide(None, "me", duration(), now()), LeaseDecision::Create);
    }

    #[test]
    fn test_own_lease_is_renewed() {
        let l = lease(Some("me"), 5, 3);
        assert_eq!(
            decide(Some(&l), "me", duration(), now()),
            LeaseDecision::Renew
        );
    }

    #[test]
    fn test_valid_foreign_lease_blocks() {
        let l = lease(Some("other"), 5, 3);
        assert_eq!(
            decide(Some(&l), "me", duration(), now()),
            LeaseDecision::Blocked
        );
    }

    #[test]
    fn test_expired_foreign_lease_is_taken_over() {
        let l = lease(Some("other"), 31, 3);
        assert_eq!(
            decide(Some(&l), "me", duration(), now()),
            LeaseDecision::TakeOver { transitions: 3 }
        );
    }

    #[test]
    fn test_released_lease_is_immediately_acquirable() {
        // A graceful release clears the holder; no need to wait for expiry.
        let l = lease(None, 0, 7);
        assert_eq!(
            decide(Some(&l), "me", duration(), now()),
            LeaseDecision::TakeOver { transitions: 7 }
        );
    }

    #[test]
    fn test_lease_without_renew_time_is_expired() {
        let mut l = lease(Some("other"), 0, 0);
        if let Some(spec) = l.spec.as_mut() {
            spec.renew_time = None;
        }
        assert_eq!(
            decide(Some(&l), "me", duration(), now()),
            LeaseDecision::TakeOver { transitions: 0 }
        );
    }

    #[test]
    fn test_boundary_not_yet_expired() {
        // Renewed exactly lease_duration ago: not strictly past expiry.
        let l = lease(Some("other"), LEASE_SECS as i64, 0);
        assert_eq!(
            decide(Some(&l), "me", duration(), now()),
            LeaseDecision::Blocked
        );
    }
}
