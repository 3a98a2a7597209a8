// Single-concurrency job executor
//
// Wakes on a fixed poll interval, and immediately when a high-priority job is
// enqueued while running. Each wake processes at most one job: dequeue,
// count the attempt, dispatch to the registered handler, then apply the retry
// and retention policies.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::clock::Clock;
use crate::errors::{ExecutionError, QueueError};
use crate::executor::registry::HandlerRegistry;
use crate::models::{EnqueueRequest, Job, JobId, JobPriority, QueueCounts, DEFAULT_MAX_ATTEMPTS};
use crate::queue::{JobPublisher, JobQueue};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::telemetry;

/// Configuration for the executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How often the executor wakes to look for work (in seconds)
    pub poll_interval_seconds: u64,
    /// Attempts granted when an enqueue request does not specify any
    pub default_max_attempts: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 30,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// What one wake cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle was already processing a job
    Busy,
    /// No eligible job was waiting
    Idle,
    Completed(JobId),
    /// The attempt failed and the job was rescheduled with backoff
    Retrying(JobId),
    /// The job reached the `failed` terminal state
    Failed(JobId),
}

struct RunLoop {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct ExecutorInner {
    config: ExecutorConfig,
    queue: JobQueue,
    registry: HandlerRegistry,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    processing: AtomicBool,
    active: AtomicBool,
    wake: Notify,
    run_loop: Mutex<Option<RunLoop>>,
}

/// Cloneable handle to the executor
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

/// Clears the processing flag even if the cycle unwinds
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        queue: JobQueue,
        registry: HandlerRegistry,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                config,
                queue,
                registry,
                retry,
                clock,
                processing: AtomicBool::new(false),
                active: AtomicBool::new(false),
                wake: Notify::new(),
                run_loop: Mutex::new(None),
            }),
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.inner.queue
    }

    /// Add a job to the queue. High-priority jobs wake a running executor immediately.
    pub async fn enqueue(&self, mut request: EnqueueRequest) -> Result<JobId, QueueError> {
        if request.max_attempts.is_none() {
            request.max_attempts = Some(self.inner.config.default_max_attempts);
        }

        let priority = request.priority;
        let job = self.inner.queue.enqueue(request, self.inner.clock.now()).await?;
        telemetry::update_queue_size(self.inner.queue.len().await as i64);

        info!(
            job_id = %job.id,
            job_type = %job.job_type(),
            priority = %priority,
            "Job accepted"
        );

        if priority == JobPriority::High && self.inner.active.load(Ordering::Acquire) {
            debug!(job_id = %job.id, "High priority job, waking executor");
            self.inner.wake.notify_one();
        }

        Ok(job.id)
    }

    pub async fn cancel(&self, id: JobId) -> Result<(), QueueError> {
        self.inner.queue.cancel(id).await?;
        telemetry::update_queue_size(self.inner.queue.len().await as i64);
        Ok(())
    }

    pub async fn get_job(&self, id: JobId) -> Option<Job> {
        self.inner.queue.get(id).await
    }

    pub async fn get_recent_jobs(&self, limit: usize) -> Vec<Job> {
        self.inner.queue.recent(limit).await
    }

    pub async fn get_queue_counts(&self) -> QueueCounts {
        self.inner.queue.counts().await
    }

    pub fn is_running(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Start the background wake loop. No-op when already running.
    #[instrument(skip(self))]
    pub async fn start(&self) {
        let mut run_loop = self.inner.run_loop.lock().await;
        if run_loop.is_some() {
            debug!("Executor already running");
            return;
        }

        info!(
            poll_interval_seconds = self.inner.config.poll_interval_seconds,
            handlers = ?self.inner.registry.job_types(),
            "Starting executor"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.inner.active.store(true, Ordering::Release);
        let executor = self.clone();
        let handle = tokio::spawn(
            async move { executor.run(shutdown_rx).await }
                .instrument(tracing::info_span!("executor")),
        );

        *run_loop = Some(RunLoop {
            shutdown_tx,
            handle,
        });
    }

    /// Stop the wake loop, letting an in-flight job finish first. No-op when stopped.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let Some(run_loop) = self.inner.run_loop.lock().await.take() else {
            debug!("Executor already stopped");
            return;
        };

        info!("Stopping executor");
        self.inner.active.store(false, Ordering::Release);
        let _ = run_loop.shutdown_tx.send(true);

        if let Err(e) = run_loop.handle.await {
            error!(error = %e, "Executor loop terminated abnormally");
        }

        info!("Executor stopped");
    }

    async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let poll_interval =
            chrono::Duration::seconds(self.inner.config.poll_interval_seconds as i64);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let outcome = self.run_once().await;
            debug!(?outcome, "Executor cycle finished");

            // Wake at the next poll, or earlier when a backoff wait ends first
            let now = self.inner.clock.now();
            let mut deadline = now + poll_interval;
            if let Some(retry_at) = self.inner.queue.next_retry_at().await {
                if retry_at > now {
                    deadline = deadline.min(retry_at);
                }
            }

            tokio::select! {
                _ = self.inner.clock.sleep_until(deadline) => {}
                _ = self.inner.wake.notified() => {
                    debug!("Executor woken early");
                }
                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping executor loop");
                    break;
                }
            }
        }
    }

    /// Run a single wake cycle
    pub async fn run_once(&self) -> CycleOutcome {
        if self
            .inner
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Executor busy, skipping cycle");
            return CycleOutcome::Busy;
        }
        let _guard = ProcessingGuard(&self.inner.processing);

        let Some(job) = self.inner.queue.dequeue_next(self.inner.clock.now()).await else {
            return CycleOutcome::Idle;
        };

        let outcome = match self.process(job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Job state changed unexpectedly during processing");
                CycleOutcome::Idle
            }
        };

        self.inner.queue.apply_retention(self.inner.clock.now()).await;
        telemetry::update_queue_size(self.inner.queue.len().await as i64);

        outcome
    }

    #[instrument(skip(self, job), fields(
        job_id = %job.id,
        job_type = %job.job_type(),
        priority = %job.priority
    ))]
    async fn process(&self, job: Job) -> Result<CycleOutcome, QueueError> {
        let queue = &self.inner.queue;
        let attempts = queue.start_attempt(job.id).await?;
        let job_type = job.job_type().to_string();

        info!(attempt = attempts, max_attempts = job.max_attempts, "Processing job");

        let started = Instant::now();
        let result = self.dispatch(&job_type, job.payload.clone()).await;
        telemetry::record_job_duration(&job_type, started.elapsed().as_secs_f64());

        let now = self.inner.clock.now();
        match result {
            Ok(output) => {
                queue.complete(job.id, output, now).await?;
                telemetry::record_job_success(&job_type);
                info!(attempt = attempts, "Job completed");
                Ok(CycleOutcome::Completed(job.id))
            }
            Err(err) => {
                let decision = if err.is_permanent() {
                    RetryDecision::Terminal
                } else {
                    self.inner.retry.decide(attempts, job.max_attempts)
                };
                let updated = queue.record_failure(job.id, &err, decision, now).await?;

                match decision {
                    RetryDecision::RetryAfter(delay) => {
                        warn!(
                            attempt = attempts,
                            error = %err,
                            retry_in_seconds = delay.as_secs(),
                            next_retry_at = ?updated.next_retry_at,
                            "Job failed, scheduled retry"
                        );
                        telemetry::record_job_failure(&job_type, "retrying");
                        Ok(CycleOutcome::Retrying(job.id))
                    }
                    RetryDecision::Terminal => {
                        error!(attempt = attempts, error = %err, "Job failed permanently");
                        telemetry::record_job_failure(
                            &job_type,
                            if err.is_permanent() { "unregistered" } else { "exhausted" },
                        );
                        Ok(CycleOutcome::Failed(job.id))
                    }
                }
            }
        }
    }

    async fn dispatch(
        &self,
        job_type: &str,
        payload: crate::models::JobPayload,
    ) -> Result<serde_json::Value, ExecutionError> {
        let Some(handler) = self.inner.registry.get(job_type) else {
            return Err(ExecutionError::UnregisteredType(job_type.to_string()));
        };

        match AssertUnwindSafe(handler(payload)).catch_unwind().await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(ExecutionError::HandlerFailed {
                job_type: job_type.to_string(),
                message: format!("{:#}", e),
            }),
            Err(panic) => Err(ExecutionError::HandlerPanicked {
                job_type: job_type.to_string(),
                message: panic_message(panic.as_ref()),
            }),
        }
    }
}

#[async_trait::async_trait]
impl JobPublisher for Executor {
    async fn publish(&self, request: EnqueueRequest) -> Result<JobId, QueueError> {
        self.enqueue(request).await
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .field("running", &self.is_running())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
