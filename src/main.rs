//! # Repository Lifecycle Service
//!
//! Runs the clone, update and delete worker pools plus the update scheduler
//! until interrupted.

use anyhow::{Context, Result};
use migration::{Migrator, MigratorTrait};
use repo_lifecycle::{
    config::ConfigLoader,
    db,
    runtime::{Components, Runtime},
    telemetry,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ConfigLoader::new()
        .load()
        .context("failed to load configuration")?;

    telemetry::init_tracing(&config).context("failed to initialize telemetry")?;

    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        info!(config = %redacted_json, "Effective configuration");
    }

    if !config.enabled {
        info!("Repository lifecycle disabled by configuration; exiting");
        return Ok(());
    }

    let db = db::init_pool(&config).await?;
    Migrator::up(&db, None)
        .await
        .context("failed to run database migrations")?;

    let components = Components::from_database(&config, db);
    let runtime = Runtime::start(&config, &components);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    runtime.shutdown().await;
    Ok(())
}
