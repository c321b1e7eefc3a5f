//! ni-registry
//!
//! Keeps network-instance index pools converged with their declared
//! registries and registers: pools are initialized from registry records,
//! registers receive stable indices, and occupancy is mirrored back as
//! registry status.

use anyhow::Result;
use nireg_registry::{config, state::AppState, store::RegistryStore};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to NIREG_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting ni-registry");
    info!(
        manifest = ?config.manifest_path,
        tick_ms = config.tick_interval.as_millis() as u64,
        max_pace_level = config.max_pace_level,
        conflict_policy = ?config.conflict_policy,
        "Configuration loaded"
    );

    let state = match AppState::from_config(&config) {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "Failed to build registry state");
            return Err(e);
        }
    };

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start reconcile worker in background
    let worker = state.worker(&config);
    let worker_handle = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
    });

    // Wait for shutdown signal (Ctrl+C)
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    } else {
        info!("Received shutdown signal");
    }

    // Signal shutdown to the worker
    let _ = shutdown_tx.send(true);

    info!("Waiting for reconcile worker to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, worker_handle).await {
        warn!(error = %e, "Reconcile worker did not shut down in time");
    }

    for pool in state.store().registries() {
        let status = state.coordinator().status(&pool);
        info!(
            pool = %pool,
            total = status.total,
            allocated = status.allocated,
            available = status.available,
            "Final pool status"
        );
    }

    info!("ni-registry shutdown complete");
    Ok(())
}
