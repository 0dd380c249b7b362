use std::sync::Arc;
use std::time::Duration;

use pgfleet_reconcile::DEFAULT_RECONCILE_INTERVAL;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone)]
pub struct ReconcileWorkerConfig {
    pub interval: Duration,
    /// Age after which a cluster claim with no provider cluster is removed.
    pub stale_claim_age: chrono::Duration,
}

impl Default for ReconcileWorkerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RECONCILE_INTERVAL,
            stale_claim_age: chrono::Duration::minutes(10),
        }
    }
}

/// Periodically settles transient projects and clusters.
pub struct ReconcileWorker {
    orchestrator: Arc<Orchestrator>,
    config: ReconcileWorkerConfig,
}

impl ReconcileWorker {
    pub fn new(orchestrator: Arc<Orchestrator>, config: ReconcileWorkerConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting reconcile worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_pass().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconcile worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One reconcile pass. Each step logs its own failure.
    pub async fn run_pass(&self) {
        let reconciler = self.orchestrator.reconciler();
        let pool = self.orchestrator.pool();

        match reconciler.sweep_stale_tasks().await {
            Ok(0) => {}
            Ok(count) => warn!(abandoned = count, "Abandoned overdue tasks"),
            Err(e) => error!(error = %e, "Failed to sweep stale tasks"),
        }

        match pool.reap_stale_claims(self.config.stale_claim_age).await {
            Ok(0) => {}
            Ok(count) => info!(reaped = count, "Removed stale cluster claims"),
            Err(e) => warn!(error = %e, "Failed to reap stale cluster claims"),
        }

        match pool.refresh_provisioning_clusters().await {
            Ok(0) => {}
            Ok(count) => info!(promoted = count, "Shared clusters became ready"),
            Err(e) => warn!(error = %e, "Failed to refresh booting clusters"),
        }

        match reconciler.reconcile_pending().await {
            Ok(0) => {}
            Ok(count) => info!(settled = count, "Projects settled"),
            Err(e) => error!(error = %e, "Failed to reconcile pending projects"),
        }
    }
}
