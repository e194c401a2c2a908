//! Reconcile background worker.
//!
//! Runs the recovery pass, then the reconciliation loop on a periodic
//! interval. Shutdown is observed between cycles, never inside one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument, warn};

use crate::error::ReconcileError;
use crate::reconciler::Reconciler;

/// Worker that drives the reconciler.
pub struct ReconcileWorker {
    reconciler: Arc<Reconciler>,
    interval: Duration,
}

impl ReconcileWorker {
    pub fn new(reconciler: Arc<Reconciler>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
        }
    }

    /// Run until shutdown is signaled.
    ///
    /// The first tick fires immediately. Until a recovery pass succeeds,
    /// every tick retries recovery instead of running a normal cycle.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting reconcile worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // A slow cycle must not cause a burst of catch-up cycles.
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut recovered = false;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if recovered {
                        self.run_cycle().await;
                    } else {
                        recovered = self.run_recovery().await;
                    }
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

    async fn run_recovery(&self) -> bool {
        match self.reconciler.recover().await {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "Recovery pass failed, retrying next tick");
                false
            }
        }
    }

    async fn run_cycle(&self) {
        if let Err(e) = self.reconciler.reconcile_once().await {
            log_cycle_error(&e);
        }
    }
}

fn log_cycle_error(e: &ReconcileError) {
    if e.is_fatal() {
        error!(error = %e, "Reconciliation aborted, no changes made");
    } else {
        warn!(error = %e, "Reconciliation skipped");
    }
}
