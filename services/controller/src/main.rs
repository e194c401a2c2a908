//! spot-guard controller
//!
//! Watches for cordoned nodes under protected workloads, scales them up for
//! the duration of the interruption and back down afterwards.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use spotguard_controller::{
    clock::SystemClock,
    cluster::{ClusterApi, KubeCluster},
    config::{Config, ScheduleBackend},
    reconciler::Reconciler,
    schedule::{ConfigMapRecords, RecordStore, ScheduleStore, SqliteRecords},
    worker::ReconcileWorker,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SPOTGUARD_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting spot-guard controller");
    info!(
        namespace_mode = config.namespace_policy.mode(),
        protected_label = %config.protected_label,
        scale_up_delay_secs = config.timing.scale_up_delay.num_seconds(),
        scale_down_delay_secs = config.timing.scale_down_delay.num_seconds(),
        check_interval_secs = config.check_interval.as_secs(),
        "Configuration loaded"
    );

    let cluster = KubeCluster::connect()
        .await
        .context("failed to connect to the cluster API")?;

    let records: Arc<dyn RecordStore> = match &config.schedule_backend {
        ScheduleBackend::ConfigMap { namespace, name } => {
            info!(namespace = %namespace, configmap = %name, "Persisting schedules in ConfigMap");
            Arc::new(ConfigMapRecords::new(cluster.client().clone(), namespace, name))
        }
        ScheduleBackend::Sqlite { path } => {
            info!(path = %path.display(), "Persisting schedules in SQLite");
            Arc::new(
                SqliteRecords::open(path)
                    .with_context(|| format!("failed to open schedule store {}", path.display()))?,
            )
        }
    };
    let store = Arc::new(ScheduleStore::new(records, config.api_timeout));
    let cluster: Arc<dyn ClusterApi> = Arc::new(cluster);

    let reconciler = Arc::new(Reconciler::new(
        cluster,
        store,
        Arc::new(SystemClock),
        config.reconciler_config(),
    ));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = ReconcileWorker::new(reconciler, config.check_interval);
    let worker_handle = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
    }

    // Signal shutdown; the worker finishes its current cycle first
    let _ = shutdown_tx.send(true);

    info!("Waiting for reconcile worker to shut down...");
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, worker_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Reconcile worker panicked"),
        Err(e) => warn!(error = %e, "Reconcile worker did not shut down in time"),
    }

    info!("spot-guard controller shutdown complete");
    Ok(())
}
