// Host handlers for the built-in job types

use anyhow::{bail, Result};
use common::executor::HandlerRegistry;
use common::models::JobPayload;
use common::JobEngine;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use tracing::info;

/// Engine handle filled in once the engine is built; the health check reads queue counts through it
pub type EngineSlot = Arc<OnceLock<JobEngine>>;

pub fn registry(engine: EngineSlot) -> HandlerRegistry {
    HandlerRegistry::new()
        .with(JobPayload::PROCESS_COMMITS, process_commits)
        .with(JobPayload::HEALTH_CHECK, move |payload| {
            health_check(engine.clone(), payload)
        })
        .with(JobPayload::BACKUP, backup)
        .with(JobPayload::CLEANUP, cleanup)
}

async fn process_commits(payload: JobPayload) -> Result<Value> {
    let JobPayload::ProcessCommits { repository, since } = payload else {
        bail!("process-commits handler received a mismatched payload");
    };

    info!(
        repository = repository.as_deref().unwrap_or("all"),
        since = ?since,
        "Processing commits"
    );
    Ok(json!({ "repository": repository, "since": since }))
}

async fn health_check(engine: EngineSlot, _payload: JobPayload) -> Result<Value> {
    let Some(engine) = engine.get() else {
        bail!("engine not initialised");
    };

    let counts = engine.get_queue_counts().await;
    info!(
        total = counts.total,
        pending = counts.pending,
        failed = counts.failed,
        "Health check"
    );
    Ok(json!({
        "status": "ok",
        "executor_running": engine.is_executor_running(),
        "queue": counts,
    }))
}

async fn backup(payload: JobPayload) -> Result<Value> {
    let JobPayload::Backup { destination } = payload else {
        bail!("backup handler received a mismatched payload");
    };

    let destination = destination.unwrap_or_else(|| "default".to_string());
    info!(destination = %destination, "Backup requested");
    Ok(json!({ "destination": destination }))
}

async fn cleanup(payload: JobPayload) -> Result<Value> {
    let JobPayload::Cleanup { older_than_days } = payload else {
        bail!("cleanup handler received a mismatched payload");
    };

    let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(older_than_days));
    info!(older_than_days, cutoff = %cutoff, "Cleanup requested");
    Ok(json!({ "older_than_days": older_than_days, "cutoff": cutoff }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::{EnqueueRequest, JobStatus};

    #[test]
    fn test_registry_covers_builtin_types() {
        let registry = registry(Arc::new(OnceLock::new()));
        assert_eq!(
            registry.job_types(),
            vec!["backup", "cleanup", "health-check", "process-commits"]
        );
    }

    #[tokio::test]
    async fn test_backup_defaults_destination() {
        let result = backup(JobPayload::Backup { destination: None }).await.unwrap();
        assert_eq!(result["destination"], "default");
    }

    #[tokio::test]
    async fn test_handler_rejects_mismatched_payload() {
        assert!(cleanup(JobPayload::HealthCheck).await.is_err());
    }

    #[tokio::test]
    async fn test_health_check_without_engine_fails() {
        let result = health_check(Arc::new(OnceLock::new()), JobPayload::HealthCheck).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_health_check_reports_queue_counts() {
        let slot: EngineSlot = Arc::new(OnceLock::new());
        let engine = JobEngine::builder()
            .handlers(registry(slot.clone()))
            .build()
            .unwrap();
        let _ = slot.set(engine.clone());

        let id = engine
            .enqueue(EnqueueRequest::new(JobPayload::HealthCheck))
            .await
            .unwrap();
        engine.executor().run_once().await;

        let job = engine.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let result = job.result.unwrap();
        assert_eq!(result["status"], "ok");
        assert_eq!(result["queue"]["processing"], 1);
    }
}
