// Scheduler binary entry point

mod handlers;

use anyhow::Context;
use common::config::Settings;
use common::telemetry;
use common::JobEngine;
use std::sync::{Arc, OnceLock};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.json_logs,
        settings.observability.tracing_endpoint.as_deref(),
    )?;

    if let Err(e) = settings.validate() {
        error!(error = %e, "Invalid configuration");
        anyhow::bail!("Invalid configuration: {}", e);
    }

    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!(
        timezone = %settings.scheduler.timezone,
        schedules = settings.scheduler.schedules.len(),
        poll_interval_seconds = settings.executor.poll_interval_seconds,
        max_jobs = settings.retention.max_jobs,
        "Configuration loaded"
    );

    let slot: handlers::EngineSlot = Arc::new(OnceLock::new());
    let engine = JobEngine::builder()
        .settings(settings)
        .handlers(handlers::registry(slot.clone()))
        .build()
        .context("Failed to build job engine")?;
    if slot.set(engine.clone()).is_err() {
        anyhow::bail!("Job engine initialised twice");
    }

    engine.start().await;
    for status in engine.get_schedule_status().await {
        info!(
            schedule = %status.name,
            cron_expression = %status.cron_expression,
            running = status.running,
            next_run = ?status.next_run,
            "Schedule registered"
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C signal, initiating graceful shutdown");

    engine.shutdown().await;
    telemetry::shutdown_tracer();

    info!("Scheduler stopped");
    Ok(())
}
