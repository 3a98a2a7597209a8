// Job engine facade: queue, executor and scheduler behind one control surface

use std::sync::Arc;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::Settings;
use crate::errors::{EngineError, ScheduleError};
use crate::executor::{Executor, HandlerRegistry};
use crate::models::{EnqueueRequest, Job, JobId, QueueCounts, ScheduleStatus};
use crate::queue::{JobPublisher, JobQueue};
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;

/// Builder for [`JobEngine`]
#[derive(Default)]
pub struct JobEngineBuilder {
    settings: Settings,
    registry: HandlerRegistry,
    clock: Option<Arc<dyn Clock>>,
    retry: Option<RetryPolicy>,
}

impl JobEngineBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn handlers(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Defaults to the system clock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Overrides the backoff derived from the executor settings
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> Result<JobEngine, EngineError> {
        let timezone = crate::schedule::parse_timezone(&self.settings.scheduler.timezone)
            .map_err(ScheduleError::from)?;
        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let retry = self
            .retry
            .unwrap_or_else(|| self.settings.executor.retry_policy());

        let queue = JobQueue::new(self.settings.retention.policy());
        let executor = Executor::new(
            self.settings.executor.executor_config(),
            queue,
            self.registry,
            retry,
            clock.clone(),
        );

        let publisher: Arc<dyn JobPublisher> = Arc::new(executor.clone());
        let scheduler = Scheduler::new(
            self.settings.scheduler.schedules(),
            timezone,
            publisher,
            clock,
        );

        Ok(JobEngine {
            executor,
            scheduler,
        })
    }
}

/// Single entry point for hosts embedding the engine
#[derive(Debug, Clone)]
pub struct JobEngine {
    executor: Executor,
    scheduler: Scheduler,
}

impl JobEngine {
    pub fn builder() -> JobEngineBuilder {
        JobEngineBuilder::default()
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId, EngineError> {
        Ok(self.executor.enqueue(request).await?)
    }

    /// Remove a pending job
    pub async fn cancel(&self, id: JobId) -> Result<(), EngineError> {
        Ok(self.executor.cancel(id).await?)
    }

    pub async fn get_job(&self, id: JobId) -> Option<Job> {
        self.executor.get_job(id).await
    }

    /// Newest first
    pub async fn get_recent_jobs(&self, limit: usize) -> Vec<Job> {
        self.executor.get_recent_jobs(limit).await
    }

    pub async fn get_queue_counts(&self) -> QueueCounts {
        self.executor.get_queue_counts().await
    }

    pub async fn start_executor(&self) {
        self.executor.start().await;
    }

    pub async fn stop_executor(&self) {
        self.executor.stop().await;
    }

    pub fn is_executor_running(&self) -> bool {
        self.executor.is_running()
    }

    pub async fn start_scheduler(&self) {
        self.scheduler.start().await;
    }

    pub async fn stop_scheduler(&self) {
        self.scheduler.stop().await;
    }

    pub async fn is_scheduler_running(&self) -> bool {
        self.scheduler.is_running().await
    }

    pub async fn update_schedule(
        &self,
        name: &str,
        cron_expression: &str,
    ) -> Result<(), EngineError> {
        Ok(self.scheduler.update_schedule(name, cron_expression).await?)
    }

    pub async fn set_schedule_enabled(
        &self,
        name: &str,
        enabled: bool,
    ) -> Result<(), EngineError> {
        Ok(self.scheduler.set_enabled(name, enabled).await?)
    }

    pub async fn trigger_manually(&self, name: &str) -> Result<JobId, EngineError> {
        Ok(self.scheduler.trigger_manually(name).await?)
    }

    pub async fn get_schedule_status(&self) -> Vec<ScheduleStatus> {
        self.scheduler.get_schedule_status().await
    }

    /// Start the executor, then arm the schedules
    pub async fn start(&self) {
        self.start_executor().await;
        self.start_scheduler().await;
        info!("Job engine started");
    }

    /// Stop creating jobs first, then drain the in-flight job
    pub async fn shutdown(&self) {
        self.stop_scheduler().await;
        self.stop_executor().await;
        info!("Job engine stopped");
    }
}
