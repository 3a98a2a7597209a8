// Scheduler engine: one cron-driven timer per schedule
//
// Each armed schedule owns a tokio task that sleeps until the next fire time
// and then publishes a job through the `JobPublisher` seam. Timers stop via a
// watch channel; a stopped timer never fires again.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::clock::Clock;
use crate::errors::ScheduleError;
use crate::models::{JobId, JobPriority, Schedule, ScheduleStatus};
use crate::queue::JobPublisher;
use crate::schedule::{next_fire_time, parse_cron_expression};
use crate::telemetry;

struct TimerHandle {
    shutdown_tx: watch::Sender<bool>,
    _handle: JoinHandle<()>,
}

impl TimerHandle {
    fn stop(self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct ScheduleEntry {
    schedule: Schedule,
    timer: Option<TimerHandle>,
}

impl ScheduleEntry {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop();
            debug!(schedule = %self.schedule.name, "Schedule timer stopped");
        }
        self.schedule.active = false;
    }
}

#[derive(Default)]
struct SchedulerState {
    running: bool,
    entries: Vec<ScheduleEntry>,
}

impl SchedulerState {
    fn entry_mut(&mut self, name: &str) -> Result<&mut ScheduleEntry, ScheduleError> {
        self.entries
            .iter_mut()
            .find(|entry| entry.schedule.name == name)
            .ok_or_else(|| ScheduleError::ScheduleNotFound(name.to_string()))
    }
}

struct SchedulerInner {
    timezone: Tz,
    publisher: Arc<dyn JobPublisher>,
    clock: Arc<dyn Clock>,
    state: Mutex<SchedulerState>,
}

/// Cloneable handle to the scheduler
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Create a stopped scheduler over a fixed schedule list.
    /// Later duplicates of a name are ignored.
    pub fn new(
        schedules: Vec<Schedule>,
        timezone: Tz,
        publisher: Arc<dyn JobPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut entries: Vec<ScheduleEntry> = Vec::with_capacity(schedules.len());
        for mut schedule in schedules {
            if entries.iter().any(|e| e.schedule.name == schedule.name) {
                warn!(schedule = %schedule.name, "Duplicate schedule name ignored");
                continue;
            }
            schedule.active = false;
            entries.push(ScheduleEntry {
                schedule,
                timer: None,
            });
        }

        Self {
            inner: Arc::new(SchedulerInner {
                timezone,
                publisher,
                clock,
                state: Mutex::new(SchedulerState {
                    running: false,
                    entries,
                }),
            }),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.inner.timezone
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.running
    }

    /// Arm a timer for every enabled schedule. A malformed expression is
    /// logged and skipped without affecting the others. No-op when running.
    /// Returns the number of timers armed.
    #[instrument(skip(self))]
    pub async fn start(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        if state.running {
            debug!("Scheduler already running");
            return 0;
        }
        state.running = true;

        let mut armed = 0;
        for entry in state.entries.iter_mut().filter(|entry| entry.schedule.enabled) {
            match self.arm(entry) {
                Ok(()) => armed += 1,
                Err(e) => {
                    error!(
                        schedule = %entry.schedule.name,
                        cron_expression = %entry.schedule.cron_expression,
                        error = %e,
                        "Skipping schedule that cannot be armed"
                    );
                }
            }
        }

        info!(
            armed,
            total = state.entries.len(),
            timezone = %self.inner.timezone,
            "Scheduler started"
        );
        armed
    }

    /// Stop every timer. No-op when already stopped.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        if !state.running {
            debug!("Scheduler already stopped");
            return;
        }
        state.running = false;

        for entry in state.entries.iter_mut() {
            entry.disarm();
        }

        info!("Scheduler stopped");
    }

    /// Replace a schedule's cron expression and re-arm its timer.
    ///
    /// The new expression is validated first; on failure the old schedule
    /// keeps running unchanged.
    #[instrument(skip(self))]
    pub async fn update_schedule(
        &self,
        name: &str,
        cron_expression: &str,
    ) -> Result<(), ScheduleError> {
        self.compile(name, cron_expression)?;

        let mut state = self.inner.state.lock().await;
        let running = state.running;
        let entry = state.entry_mut(name)?;

        let previous = std::mem::replace(
            &mut entry.schedule.cron_expression,
            cron_expression.to_string(),
        );
        entry.disarm();

        if running && entry.schedule.enabled {
            self.arm(entry)?;
        }

        info!(
            schedule = %name,
            previous = %previous,
            cron_expression = %cron_expression,
            "Schedule updated"
        );
        Ok(())
    }

    /// Pause or resume a single schedule's timer
    #[instrument(skip(self))]
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), ScheduleError> {
        let mut state = self.inner.state.lock().await;
        let running = state.running;
        let entry = state.entry_mut(name)?;

        entry.schedule.enabled = enabled;
        if !enabled {
            entry.disarm();
        } else if running && entry.timer.is_none() {
            self.arm(entry)?;
        }

        info!(schedule = %name, enabled, "Schedule toggled");
        Ok(())
    }

    /// Enqueue the schedule's job right away with high priority
    #[instrument(skip(self))]
    pub async fn trigger_manually(&self, name: &str) -> Result<JobId, ScheduleError> {
        let request = {
            let mut state = self.inner.state.lock().await;
            let entry = state.entry_mut(name)?;
            entry.schedule.enqueue_request().with_priority(JobPriority::High)
        };

        let job_id = self
            .inner
            .publisher
            .publish(request)
            .await
            .map_err(|e| ScheduleError::Publish {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        info!(schedule = %name, job_id = %job_id, "Schedule triggered manually");
        Ok(job_id)
    }

    /// Status of every schedule, in configuration order
    pub async fn get_schedule_status(&self) -> Vec<ScheduleStatus> {
        let now = self.inner.clock.now();
        let state = self.inner.state.lock().await;

        state
            .entries
            .iter()
            .map(|entry| {
                let running = entry.timer.is_some();
                let next_run = if running {
                    parse_cron_expression(&entry.schedule.cron_expression)
                        .ok()
                        .and_then(|cron| next_fire_time(&cron, self.inner.timezone, now))
                } else {
                    None
                };

                ScheduleStatus {
                    name: entry.schedule.name.clone(),
                    cron_expression: entry.schedule.cron_expression.clone(),
                    job_type: entry.schedule.job_type().to_string(),
                    running,
                    last_run: entry.schedule.last_run,
                    next_run,
                }
            })
            .collect()
    }

    pub async fn schedule(&self, name: &str) -> Option<Schedule> {
        let state = self.inner.state.lock().await;
        state
            .entries
            .iter()
            .find(|entry| entry.schedule.name == name)
            .map(|entry| entry.schedule.clone())
    }

    pub async fn schedule_names(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        state
            .entries
            .iter()
            .map(|entry| entry.schedule.name.clone())
            .collect()
    }

    /// Parse an expression and make sure it still fires at some point
    fn compile(&self, name: &str, cron_expression: &str) -> Result<CronSchedule, ScheduleError> {
        let cron = parse_cron_expression(cron_expression)?;
        if next_fire_time(&cron, self.inner.timezone, self.inner.clock.now()).is_none() {
            return Err(ScheduleError::NoNextExecution(name.to_string()));
        }
        Ok(cron)
    }

    fn arm(&self, entry: &mut ScheduleEntry) -> Result<(), ScheduleError> {
        let cron = self.compile(&entry.schedule.name, &entry.schedule.cron_expression)?;
        let name = entry.schedule.name.clone();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = self.clone();
        let span = tracing::info_span!("schedule_timer", schedule = %name);
        let handle = tokio::spawn(
            async move { scheduler.run_timer(name, cron, shutdown_rx).await }.instrument(span),
        );

        entry.timer = Some(TimerHandle {
            shutdown_tx,
            _handle: handle,
        });
        entry.schedule.active = true;
        debug!(schedule = %entry.schedule.name, "Schedule timer armed");
        Ok(())
    }

    async fn run_timer(
        &self,
        name: String,
        cron: CronSchedule,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let now = self.inner.clock.now();
            let Some(next) = next_fire_time(&cron, self.inner.timezone, now) else {
                warn!("Cron expression has no future fire time, timer exiting");
                break;
            };
            debug!(next_run = %next, "Timer sleeping until next fire time");

            tokio::select! {
                _ = self.inner.clock.sleep_until(next) => {}
                _ = shutdown_rx.changed() => {}
            }

            if *shutdown_rx.borrow() {
                break;
            }

            self.fire(&name, next, &shutdown_rx).await;
        }
    }

    async fn fire(
        &self,
        name: &str,
        scheduled_for: DateTime<Utc>,
        shutdown_rx: &watch::Receiver<bool>,
    ) {
        let request = {
            let mut state = self.inner.state.lock().await;
            // The timer may have been stopped or replaced while waiting for the lock
            if *shutdown_rx.borrow() {
                debug!(schedule = %name, "Timer stopped before firing, skipping");
                return;
            }
            let Ok(entry) = state.entry_mut(name) else {
                warn!(schedule = %name, "Fired schedule no longer exists");
                return;
            };
            if entry.timer.is_none() {
                debug!(schedule = %name, "Schedule disarmed before firing, skipping");
                return;
            }
            entry.schedule.last_run = Some(self.inner.clock.now());
            entry.schedule.enqueue_request()
        };

        telemetry::record_schedule_fired(name);

        match self.inner.publisher.publish(request).await {
            Ok(job_id) => {
                info!(
                    schedule = %name,
                    job_id = %job_id,
                    scheduled_for = %scheduled_for,
                    "Schedule fired"
                );
            }
            Err(e) => {
                error!(schedule = %name, error = %e, "Failed to enqueue scheduled job");
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("timezone", &self.inner.timezone)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::{QueueError, ValidationError};
    use crate::models::{EnqueueRequest, JobPayload};
    use chrono::{Duration, TimeZone};

    /// Mock job publisher that records every request
    #[derive(Default)]
    struct MockJobPublisher {
        published: std::sync::Mutex<Vec<EnqueueRequest>>,
    }

    impl MockJobPublisher {
        fn published(&self) -> Vec<EnqueueRequest> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl JobPublisher for MockJobPublisher {
        async fn publish(&self, request: EnqueueRequest) -> Result<JobId, QueueError> {
            self.published.lock().unwrap().push(request);
            Ok(JobId::new())
        }
    }

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 2, 0).unwrap()
    }

    fn schedules() -> Vec<Schedule> {
        vec![
            Schedule::new(
                "main-posting",
                "*/5 * * * *",
                JobPayload::ProcessCommits {
                    repository: None,
                    since: None,
                },
                JobPriority::Medium,
            ),
            Schedule::new(
                "daily-backup",
                "0 2 * * *",
                JobPayload::Backup { destination: None },
                JobPriority::Low,
            ),
        ]
    }

    fn scheduler(schedules: Vec<Schedule>) -> (Scheduler, Arc<MockJobPublisher>, ManualClock) {
        let clock = ManualClock::new(start_time());
        let publisher = Arc::new(MockJobPublisher::default());
        let scheduler = Scheduler::new(
            schedules,
            chrono_tz::UTC,
            publisher.clone(),
            Arc::new(clock.clone()),
        );
        (scheduler, publisher, clock)
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_start_arms_all_valid_schedules() {
        let (scheduler, _, _) = scheduler(schedules());
        assert_eq!(scheduler.start().await, 2);
        assert!(scheduler.is_running().await);

        let status = scheduler.get_schedule_status().await;
        assert!(status.iter().all(|s| s.running));
        assert_eq!(
            status[0].next_run,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 10, 5, 0).unwrap())
        );
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (scheduler, _, _) = scheduler(schedules());
        assert_eq!(scheduler.start().await, 2);
        assert_eq!(scheduler.start().await, 0);
        scheduler.stop().await;
        scheduler.stop().await;
        assert!(!scheduler.is_running().await);
    }

    #[tokio::test]
    async fn test_invalid_schedule_is_skipped_not_fatal() {
        let mut list = schedules();
        list.push(Schedule::new(
            "broken",
            "not-a-cron",
            JobPayload::HealthCheck,
            JobPriority::Low,
        ));
        let (scheduler, _, _) = scheduler(list);

        assert_eq!(scheduler.start().await, 2);
        let status = scheduler.get_schedule_status().await;
        let broken = status.iter().find(|s| s.name == "broken").unwrap();
        assert!(!broken.running);
        assert!(status.iter().filter(|s| s.running).count() == 2);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_timer_fires_and_records_last_run() {
        let (scheduler, publisher, clock) = scheduler(schedules());
        scheduler.start().await;
        settle().await;
        assert!(publisher.published().is_empty());

        clock.advance(Duration::minutes(3));
        settle().await;

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].priority, JobPriority::Medium);
        assert_eq!(published[0].payload.job_type(), JobPayload::PROCESS_COMMITS);

        let schedule = scheduler.schedule("main-posting").await.unwrap();
        assert_eq!(schedule.last_run, Some(clock.now()));
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_stopped_scheduler_does_not_fire() {
        let (scheduler, publisher, clock) = scheduler(schedules());
        scheduler.start().await;
        settle().await;
        scheduler.stop().await;

        clock.advance(Duration::hours(1));
        settle().await;
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_timer_woken_during_stop_does_not_publish() {
        let (scheduler, publisher, clock) = scheduler(schedules());
        scheduler.start().await;
        settle().await;

        // Hold the state lock so the timer wakes and queues behind it
        let mut state = scheduler.inner.state.lock().await;
        clock.advance(Duration::minutes(3));
        settle().await;

        state.running = false;
        for entry in state.entries.iter_mut() {
            entry.disarm();
        }
        drop(state);
        settle().await;

        assert!(publisher.published().is_empty());
        let schedule = scheduler.schedule("main-posting").await.unwrap();
        assert_eq!(schedule.last_run, None);
    }

    #[tokio::test]
    async fn test_timer_replaced_during_update_does_not_publish() {
        let (scheduler, publisher, clock) = scheduler(schedules());
        scheduler.start().await;
        settle().await;

        let mut state = scheduler.inner.state.lock().await;
        clock.advance(Duration::minutes(3));
        settle().await;

        // Re-arm in place, as update_schedule does, while the old timer waits
        let entry = state.entry_mut("main-posting").unwrap();
        entry.schedule.cron_expression = "0 11 * * *".to_string();
        entry.disarm();
        scheduler.arm(entry).unwrap();
        drop(state);
        settle().await;

        assert!(publisher.published().is_empty());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_update_with_invalid_expression_keeps_old_schedule() {
        let (scheduler, _, _) = scheduler(schedules());
        scheduler.start().await;

        let err = scheduler
            .update_schedule("main-posting", "not-a-cron")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::Validation(ValidationError::InvalidCronExpression { .. })
        ));

        let status = scheduler.get_schedule_status().await;
        let main = status.iter().find(|s| s.name == "main-posting").unwrap();
        assert!(main.running);
        assert_eq!(main.cron_expression, "*/5 * * * *");
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_update_rejects_expression_without_future_fire_time() {
        let (scheduler, _, _) = scheduler(schedules());
        // Seven-field form with a year already in the past
        let err = scheduler
            .update_schedule("main-posting", "0 0 9 * * * 2020")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ScheduleError::NoNextExecution("main-posting".to_string())
        );
    }

    #[tokio::test]
    async fn test_update_unknown_schedule() {
        let (scheduler, _, _) = scheduler(schedules());
        let err = scheduler
            .update_schedule("missing", "*/5 * * * *")
            .await
            .unwrap_err();
        assert_eq!(err, ScheduleError::ScheduleNotFound("missing".to_string()));
    }

    #[tokio::test]
    async fn test_update_rearms_with_new_expression() {
        let (scheduler, publisher, clock) = scheduler(schedules());
        scheduler.start().await;
        settle().await;

        scheduler
            .update_schedule("main-posting", "0 11 * * *")
            .await
            .unwrap();
        settle().await;

        // The old */5 timer would have fired at 10:05
        clock.advance(Duration::minutes(10));
        settle().await;
        assert!(publisher.published().is_empty());

        let status = scheduler.get_schedule_status().await;
        let main = status.iter().find(|s| s.name == "main-posting").unwrap();
        assert!(main.running);
        assert_eq!(
            main.next_run,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap())
        );
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_trigger_manually_uses_high_priority() {
        let (scheduler, publisher, _) = scheduler(schedules());
        scheduler.trigger_manually("daily-backup").await.unwrap();

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].priority, JobPriority::High);
        assert_eq!(published[0].payload.job_type(), JobPayload::BACKUP);

        assert!(matches!(
            scheduler.trigger_manually("missing").await,
            Err(ScheduleError::ScheduleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_schedule_not_armed() {
        let (scheduler, _, _) = scheduler(schedules());
        scheduler.set_enabled("daily-backup", false).await.unwrap();
        assert_eq!(scheduler.start().await, 1);

        scheduler.set_enabled("daily-backup", true).await.unwrap();
        let status = scheduler.get_schedule_status().await;
        assert!(status.iter().all(|s| s.running));
        scheduler.stop().await;
    }

    #[test]
    fn test_duplicate_names_are_ignored() {
        let mut list = schedules();
        list.push(Schedule::new(
            "main-posting",
            "0 0 * * *",
            JobPayload::HealthCheck,
            JobPriority::High,
        ));
        let (scheduler, _, _) = scheduler(list);
        let names = futures::executor::block_on(scheduler.schedule_names());
        assert_eq!(names, vec!["main-posting", "daily-backup"]);
    }
}
