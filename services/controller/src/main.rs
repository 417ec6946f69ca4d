//! jobsync Work Controller
//!
//! Long-running process that mirrors a local job queue onto a platform work
//! scheduler and repairs drift between the two.
//!
//! ## Architecture
//!
//! - **Controller**: Wake/sleep state machine driven by host lifecycle signals
//! - **Reconciler**: Periodically detects and re-submits lost work requests
//! - **Sentinel**: Compares job records against live scheduler requests
//! - **Scheduler**: Abstracts the platform scheduler (mock in dev)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use jobsync_controller::config::Config;
use jobsync_controller::controller::{Signal, WorkController};
use jobsync_controller::reconciler::{ReconcileLock, Reconciler};
use jobsync_controller::scheduler::{MockScheduler, WorkScheduler};
use jobsync_controller::store::JobStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to JOBSYNC_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting jobsync work controller");
    info!(
        data_dir = %config.data_dir.display(),
        db_path = %config.db_path.display(),
        reconcile_interval_secs = config.reconcile_interval_secs,
        pass_timeout_secs = config.pass_timeout_secs,
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.data_dir)?;

    // Open local job state
    let store = Arc::new(JobStore::open(&config.db_path)?);

    // Create the scheduler (mock for now)
    let scheduler: Arc<dyn WorkScheduler> = Arc::new(MockScheduler::new());

    // Create shutdown channel for the periodic loop
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = Arc::new(
        Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&scheduler),
            ReconcileLock::new(&config.data_dir),
        )
        .with_pass_timeout(Duration::from_secs(config.pass_timeout_secs)),
    );

    // Start the periodic reconciliation loop
    let periodic_handle = tokio::spawn({
        let reconciler = Arc::clone(&reconciler);
        let interval = Duration::from_secs(config.reconcile_interval_secs);
        async move {
            reconciler.run(interval, shutdown_rx).await;
        }
    });

    // Spawn the controller and bring it up
    let handle = WorkController::new(scheduler, reconciler).spawn(64);
    handle.signal(Signal::Wake).await;
    handle.signal(Signal::Reconcile).await;

    let mut terminated = handle.terminated();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            handle.signal(Signal::Stop).await;
        }
        _ = terminated.wait_for(|t| *t) => {
            info!("Controller terminated");
        }
    }

    // Signal shutdown to the periodic loop
    let _ = shutdown_tx.send(true);
    let _ = periodic_handle.await;

    // Give in-flight work time to settle
    info!("Waiting for workers to shut down...");
    tokio::time::sleep(Duration::from_secs(2)).await;

    info!("Work controller shutdown complete");
    Ok(())
}
