//! Cluster supervisor: leader election wrapped around a controller set
//!
//! One supervisor per mirrored cluster. It loops: acquire the cluster's
//! lease, start every registered controller under one stop signal, and wait.
//! Losing the lease cancels the stop signal — in-flight syncs finish, no new
//! ones start — and the supervisor re-enters the election loop, so leadership
//! churn is a restart cycle rather than a terminal failure. Regained
//! leadership starts controllers fresh, behind a cold cache-sync barrier.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::election::Leadership;
use crate::registry::{ControllerRegistry, SupervisorContext};

/// Delay before retrying after an election or startup failure
const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Election-gated runner for one cluster's controllers
pub struct ClusterSupervisor {
    ctx: Arc<SupervisorContext>,
    registry: Arc<ControllerRegistry>,
    leadership: Arc<dyn Leadership>,
}

impl ClusterSupervisor {
    /// Create a supervisor over an explicit registry and leadership provider
    pub fn new(
        ctx: Arc<SupervisorContext>,
        registry: Arc<ControllerRegistry>,
        leadership: Arc<dyn Leadership>,
    ) -> Self {
        Self {
            ctx,
            registry,
            leadership,
        }
    }

    /// Run the election loop until the outer shutdown token fires
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            let mut term = tokio::select! {
                _ = shutdown.cancelled() => return,
                acquired = self.leadership.acquire() => match acquired {
                    Ok(term) => term,
                    Err(e) => {
                        warn!(cluster = %self.ctx.cluster, error = %e, "election failed, retrying");
                        if wait_or_shutdown(&shutdown, RESTART_DELAY).await {
                            return;
                        }
                        continue;
                    }
                },
            };

            info!(
                cluster = %self.ctx.cluster,
                controllers = self.registry.len(),
                "leadership acquired, starting controllers"
            );
            let stop = CancellationToken::new();
            let handles = match self.registry.start_all(&self.ctx, &stop) {
                Ok(handles) => handles,
                Err(e) => {
                    warn!(cluster = %self.ctx.cluster, error = %e, "failed to start controllers");
                    stop.cancel();
                    term.release().await;
                    if wait_or_shutdown(&shutdown, RESTART_DELAY).await {
                        return;
                    }
                    continue;
                }
            };

            let graceful = tokio::select! {
                _ = term.lost() => {
                    warn!(cluster = %self.ctx.cluster, "leadership lost, stopping controllers");
                    false
                }
                _ = shutdown.cancelled() => {
                    info!(cluster = %self.ctx.cluster, "shutdown requested, stopping controllers");
                    true
                }
            };

            stop.cancel();
            for handle in handles {
                let _ = handle.await;
            }

            if graceful {
                // Release so a standby takes over without waiting for expiry.
                term.release().await;
                return;
            }
            // Lost leadership: the lease belongs to someone else now; just
            // re-enter the election loop.
        }
    }
}

/// Sleep for `delay`, returning true if shutdown fired first
async fn wait_or_shutdown(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
