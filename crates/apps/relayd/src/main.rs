//! relayd - the Relay scheduler daemon
//!
//! Ticks the schedule resolver at a fixed interval and hands due sync runs
//! to the worker pool until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{error, info};
use relay::{
    ConnectorRegistry, EngineSettings, LogNotifier, Orchestrator, SqliteSyncStore, SyncStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    // Bootstrap config directory
    let config_dir = config::init().context("Failed to initialize config directory")?;
    let settings = EngineSettings::load(&config_dir)?;

    let db_path = config_dir.path(&settings.database_file);
    let store: Arc<dyn SyncStore> = Arc::new(SqliteSyncStore::new(&db_path)?);
    info!("Using database at {}", db_path.display());

    let registry = ConnectorRegistry::with_defaults(settings.http_timeout());
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        registry,
        Arc::new(LogNotifier),
        &settings,
    )?);

    // Runs a previous process left open would block their syncs forever
    let recovered = orchestrator
        .recover_interrupted()
        .context("Failed to recover interrupted runs")?;
    if !recovered.is_empty() {
        info!("Marked {} interrupted runs as failed", recovered.len());
    }

    info!(
        "relayd started:{} workers, chunk size {}, tick every {}s",
        settings.worker_threads, settings.chunk_size, settings.tick_interval_secs
    );

    let mut ticker = tokio::time::interval(settings.tick_interval());
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let orchestrator = orchestrator.clone();
                // SQLite access blocks; keep it off the async workers
                let result =
                    tokio::task::spawn_blocking(move || orchestrator.run_due(Utc::now())).await;
                match result {
                    Ok(Ok(runs)) if !runs.is_empty() => info!("Submitted {} due runs", runs.len()),
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!("Scheduler tick failed: {}", e),
                    Err(e) => error!("Scheduler tick panicked: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
