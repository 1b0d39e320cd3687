// Lumen-PG - role-authenticated PostgreSQL data access
// Process entry point

use anyhow::Context;
use lumen_core::CancellationToken;
use lumen_pg::config::Config;
use lumen_pg::observability::{init_tracing, LogSettings};
use lumen_pg::{metrics, AppState};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let config = Config::from_env().context("invalid configuration")?;
    init_tracing(&LogSettings {
        directory: config.log_dir.clone(),
        retention_days: None,
    });
    info!(server = %config.superadmin.display_name(), "starting lumen-pg");

    let state = AppState::new(&config);
    let shutdown = CancellationToken::new();

    state
        .cache
        .load_all(&shutdown)
        .await
        .context("failed to load cluster metadata")?;

    let sweeper = state.spawn_sweeper(config.sweep_interval, shutdown.child_token());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    shutdown.cancel();

    if let Err(e) = sweeper.await {
        warn!(error = %e, "sweeper task ended abnormally");
    }
    info!(metrics = ?metrics::snapshot(), "stopped");
    Ok(())
}
