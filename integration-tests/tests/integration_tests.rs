// Integration tests for the job engine
// These tests drive end-to-end workflows through the public facade with a manual clock

use chrono::{DateTime, Duration, TimeZone, Utc};
use common::clock::{Clock, ManualClock};
use common::config::Settings;
use common::executor::{CycleOutcome, HandlerRegistry};
use common::models::{EnqueueRequest, JobPayload, JobPriority, JobStatus};
use common::JobEngine;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap()
}

/// Registry for the built-in types that records the order jobs ran in
fn recording_registry(log: Arc<Mutex<Vec<String>>>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for job_type in [
        JobPayload::PROCESS_COMMITS,
        JobPayload::HEALTH_CHECK,
        JobPayload::BACKUP,
        JobPayload::CLEANUP,
    ] {
        let log = log.clone();
        registry.register(job_type, move |payload: JobPayload| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(payload.job_type().to_string());
                Ok(json!({ "handled": payload.job_type() }))
            }
        });
    }
    registry
}

fn build_engine(settings: Settings, registry: HandlerRegistry) -> (JobEngine, ManualClock) {
    let clock = ManualClock::new(start_time());
    let engine = JobEngine::builder()
        .settings(settings)
        .handlers(registry)
        .clock(Arc::new(clock.clone()))
        .build()
        .expect("Failed to build engine");
    (engine, clock)
}

/// Let spawned timer and executor tasks make progress
async fn settle() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_high_priority_job_runs_before_earlier_low_priority_job() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (engine, _clock) = build_engine(Settings::default(), recording_registry(log.clone()));

    engine
        .enqueue(
            EnqueueRequest::new(JobPayload::Backup { destination: None })
                .with_priority(JobPriority::Low),
        )
        .await
        .unwrap();
    engine
        .enqueue(EnqueueRequest::new(JobPayload::HealthCheck).with_priority(JobPriority::High))
        .await
        .unwrap();

    engine.executor().run_once().await;
    engine.executor().run_once().await;

    assert_eq!(*log.lock().unwrap(), vec!["health-check", "backup"]);
    let counts = engine.get_queue_counts().await;
    assert_eq!(counts.completed, 2);
    assert_eq!(counts.pending, 0);
}

#[tokio::test]
async fn test_running_executor_wakes_for_high_priority_job() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (engine, _clock) = build_engine(Settings::default(), recording_registry(log.clone()));

    engine.start_executor().await;
    settle().await;

    let id = engine
        .enqueue(EnqueueRequest::new(JobPayload::HealthCheck).with_priority(JobPriority::High))
        .await
        .unwrap();
    settle().await;

    // The poll interval has not elapsed on the manual clock; only the wake-up ran the job
    assert_eq!(engine.get_job(id).await.unwrap().status, JobStatus::Completed);
    engine.stop_executor().await;
}

#[tokio::test]
async fn test_failing_job_retries_with_backoff_then_fails() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_handler = calls.clone();
    let registry = HandlerRegistry::new().with("flaky", move |_| {
        let calls = calls_in_handler.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("downstream unavailable"))
        }
    });
    let (engine, clock) = build_engine(Settings::default(), registry);

    let id = engine
        .enqueue(EnqueueRequest::new(JobPayload::custom("flaky", json!({}))).with_max_attempts(3))
        .await
        .unwrap();

    assert_eq!(engine.executor().run_once().await, CycleOutcome::Retrying(id));
    let job = engine.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.next_retry_at, Some(clock.now() + Duration::seconds(60)));
    assert!(job.error.unwrap().contains("downstream unavailable"));

    // Not yet eligible
    clock.advance(Duration::seconds(59));
    assert_eq!(engine.executor().run_once().await, CycleOutcome::Idle);

    clock.advance(Duration::seconds(1));
    assert_eq!(engine.executor().run_once().await, CycleOutcome::Retrying(id));
    let job = engine.get_job(id).await.unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(job.next_retry_at, Some(clock.now() + Duration::seconds(120)));

    clock.advance(Duration::seconds(120));
    assert_eq!(engine.executor().run_once().await, CycleOutcome::Failed(id));
    let job = engine.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.next_retry_at, None);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Failed jobs are never picked up again
    clock.advance(Duration::hours(1));
    assert_eq!(engine.executor().run_once().await, CycleOutcome::Idle);
}

#[tokio::test]
async fn test_unregistered_job_type_fails_without_retry() {
    let (engine, _clock) = build_engine(Settings::default(), HandlerRegistry::new());

    let id = engine
        .enqueue(EnqueueRequest::new(JobPayload::custom("mystery", json!(null))))
        .await
        .unwrap();
    assert_eq!(engine.executor().run_once().await, CycleOutcome::Failed(id));

    let job = engine.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.error.unwrap().contains("mystery"));
}

#[tokio::test]
async fn test_cancel_only_pending_jobs() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (engine, _clock) = build_engine(Settings::default(), recording_registry(log));

    let done = engine
        .enqueue(EnqueueRequest::new(JobPayload::HealthCheck).with_priority(JobPriority::High))
        .await
        .unwrap();
    let waiting = engine
        .enqueue(EnqueueRequest::new(JobPayload::HealthCheck))
        .await
        .unwrap();
    engine.executor().run_once().await;

    let err = engine.cancel(done).await.unwrap_err();
    assert!(!err.is_not_found());
    assert_eq!(engine.get_job(done).await.unwrap().status, JobStatus::Completed);

    engine.cancel(waiting).await.unwrap();
    assert!(engine.get_job(waiting).await.is_none());
    assert!(engine.cancel(waiting).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_retention_bounds_queue_size() {
    let mut settings = Settings::default();
    settings.retention.max_jobs = 5;
    let log = Arc::new(Mutex::new(Vec::new()));
    let (engine, clock) = build_engine(settings, recording_registry(log));

    for _ in 0..10 {
        engine
            .enqueue(EnqueueRequest::new(JobPayload::HealthCheck))
            .await
            .unwrap();
        clock.advance(Duration::seconds(1));
    }
    while let CycleOutcome::Completed(_) = engine.executor().run_once().await {}

    let counts = engine.get_queue_counts().await;
    assert!(counts.total <= 5);
    assert_eq!(counts.pending, 0);

    // Only the newest jobs survive
    let recent = engine.get_recent_jobs(10).await;
    assert_eq!(recent.len(), counts.total);
    assert!(recent.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    assert_eq!(recent[0].created_at, start_time() + Duration::seconds(9));
}

#[tokio::test]
async fn test_schedule_fires_and_enqueues_job() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (engine, clock) = build_engine(Settings::default(), recording_registry(log));

    engine.start_scheduler().await;
    settle().await;
    assert_eq!(engine.get_queue_counts().await.total, 0);

    // health-check runs every 15 minutes
    clock.advance(Duration::minutes(15));
    settle().await;

    let jobs = engine.get_recent_jobs(10).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_type(), JobPayload::HEALTH_CHECK);
    assert_eq!(jobs[0].priority, JobPriority::Low);

    let status = engine.get_schedule_status().await;
    let health = status.iter().find(|s| s.name == "health-check").unwrap();
    assert_eq!(health.last_run, Some(clock.now()));
    assert_eq!(health.next_run, Some(clock.now() + Duration::minutes(15)));

    engine.stop_scheduler().await;
}

#[tokio::test]
async fn test_invalid_schedule_update_keeps_previous_timer() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (engine, clock) = build_engine(Settings::default(), recording_registry(log));
    engine.start_scheduler().await;
    settle().await;

    let err = engine
        .update_schedule("health-check", "not-a-cron")
        .await
        .unwrap_err();
    assert!(err.is_validation());

    clock.advance(Duration::minutes(15));
    settle().await;

    let status = engine.get_schedule_status().await;
    let health = status.iter().find(|s| s.name == "health-check").unwrap();
    assert_eq!(health.cron_expression, "*/15 * * * *");
    assert!(health.running);
    assert_eq!(engine.get_queue_counts().await.total, 1);

    engine.stop_scheduler().await;
}

#[tokio::test]
async fn test_manual_trigger_enqueues_high_priority_job() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (engine, _clock) = build_engine(Settings::default(), recording_registry(log.clone()));

    engine
        .enqueue(EnqueueRequest::new(JobPayload::HealthCheck).with_priority(JobPriority::Medium))
        .await
        .unwrap();
    let id = engine.trigger_manually("daily-backup").await.unwrap();

    let job = engine.get_job(id).await.unwrap();
    assert_eq!(job.priority, JobPriority::High);
    assert_eq!(job.job_type(), JobPayload::BACKUP);

    engine.executor().run_once().await;
    assert_eq!(*log.lock().unwrap(), vec!["backup"]);

    let status = engine.get_schedule_status().await;
    let backup = status.iter().find(|s| s.name == "daily-backup").unwrap();
    assert_eq!(backup.last_run, None);

    assert!(engine.trigger_manually("nope").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_job() {
    let release = Arc::new(Notify::new());
    let started = Arc::new(Notify::new());
    let (release_in_handler, started_in_handler) = (release.clone(), started.clone());
    let registry = HandlerRegistry::new().with("slow", move |_| {
        let (release, started) = (release_in_handler.clone(), started_in_handler.clone());
        async move {
            started.notify_one();
            release.notified().await;
            Ok(json!("finished"))
        }
    });
    let (engine, _clock) = build_engine(Settings::default(), registry);

    let id = engine
        .enqueue(EnqueueRequest::new(JobPayload::custom("slow", json!({}))))
        .await
        .unwrap();
    engine.start().await;
    started.notified().await;

    let stopping = tokio::spawn({
        let engine = engine.clone();
        async move { engine.shutdown().await }
    });
    settle().await;
    assert!(!stopping.is_finished());
    assert_eq!(engine.get_job(id).await.unwrap().status, JobStatus::Processing);

    release.notify_one();
    stopping.await.unwrap();

    let job = engine.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(json!("finished")));
    assert!(!engine.is_executor_running());
}
