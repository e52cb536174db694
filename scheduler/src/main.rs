// Scheduler binary entry point

use anyhow::Context;
use common::config::Settings;
use common::db::DbPool;
use common::scheduler::Scheduler;
use common::telemetry;
use common::worker::PayloadRegistry;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    // Initialize structured logging (and OTLP export when configured)
    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;

    info!("Starting job scheduler");

    telemetry::init_metrics(settings.observability.metrics_port)?;

    info!(
        database_url = %settings.database.url,
        concurrency = settings.worker.concurrency,
        "Configuration loaded"
    );

    // Initialize the job store
    let db_pool = DbPool::new(&settings.database).await.map_err(|e| {
        error!(error = %e, "Failed to initialize database pool");
        e
    })?;
    db_pool.migrate().await.map_err(|e| {
        error!(error = %e, "Failed to run database migrations");
        e
    })?;
    info!("Job store ready");

    let registry = Arc::new(PayloadRegistry::with_builtins());
    info!(payloads = ?registry.keys(), "Payload registry initialized");

    let scheduler = Scheduler::new(db_pool.clone(), &settings, registry);
    scheduler.start().await?;

    // Handle SIGINT for graceful shutdown
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C signal, initiating graceful shutdown");

    if let Err(e) = scheduler.shutdown().await {
        error!(error = %e, "Error during scheduler shutdown");
    }
    db_pool.close().await;
    telemetry::shutdown_tracer();

    info!("Scheduler stopped");
    Ok(())
}
