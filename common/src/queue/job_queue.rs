// Priority-ordered in-memory job queue
//
// Jobs are kept in one vector ordered by priority tier, FIFO within a tier.
// Insertion scans for the first resident job with a strictly lower weight and
// inserts before it, so equal-priority jobs keep arrival order. Expected sizes
// are tens to low hundreds of jobs, which keeps the O(n) scan cheap.
//
// All operations go through a single mutex, so enqueue, dequeue and cancel
// are mutually exclusive.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::errors::{ExecutionError, QueueError};
use crate::models::{EnqueueRequest, Job, JobId, JobStatus, QueueCounts};
use crate::retention::RetentionPolicy;
use crate::retry::RetryDecision;

/// Shared handle to the job collection
#[derive(Debug, Clone)]
pub struct JobQueue {
    jobs: Arc<Mutex<Vec<Job>>>,
    retention: RetentionPolicy,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

impl JobQueue {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(Vec::new())),
            retention,
        }
    }

    /// Validate and insert a new pending job, returning a snapshot of it
    #[instrument(
        skip(self, request),
        fields(job_type = %request.payload.job_type(), priority = %request.priority)
    )]
    pub async fn enqueue(
        &self,
        request: EnqueueRequest,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        request.validate()?;

        let job = Job::new(request, now);
        let mut jobs = self.jobs.lock().await;
        let weight = job.priority.weight();
        let position = jobs
            .iter()
            .position(|resident| resident.priority.weight() < weight)
            .unwrap_or(jobs.len());
        jobs.insert(position, job.clone());

        debug!(job_id = %job.id, position, queue_len = jobs.len(), "Job enqueued");
        Ok(job)
    }

    /// Select the next eligible job and mark it `processing` in place.
    ///
    /// Returns `None` when nothing is eligible or another job is already processing.
    pub async fn dequeue_next(&self, now: DateTime<Utc>) -> Option<Job> {
        let mut jobs = self.jobs.lock().await;

        if jobs.iter().any(|job| job.status == JobStatus::Processing) {
            debug!("A job is already processing, nothing dequeued");
            return None;
        }

        let job = jobs.iter_mut().find(|job| job.is_eligible(now))?;
        job.status = JobStatus::Processing;
        job.started_at = Some(now);
        Some(job.clone())
    }

    /// Count one execution attempt for a processing job and return the new total
    pub async fn start_attempt(&self, id: JobId) -> Result<u32, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let job = find_mut(&mut jobs, id)?;
        require_status(job, JobStatus::Processing)?;

        job.attempts = (job.attempts + 1).min(job.max_attempts);
        Ok(job.attempts)
    }

    /// Mark a processing job as completed
    pub async fn complete(
        &self,
        id: JobId,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let job = find_mut(&mut jobs, id)?;
        require_status(job, JobStatus::Processing)?;

        job.status = JobStatus::Completed;
        job.result = Some(result);
        job.error = None;
        job.next_retry_at = None;
        job.completed_at = Some(now);
        Ok(job.clone())
    }

    /// Record a failed attempt on a processing job.
    ///
    /// Permanent errors and terminal decisions move the job to `failed`;
    /// otherwise it returns to `pending` with `next_retry_at` set.
    pub async fn record_failure(
        &self,
        id: JobId,
        error: &ExecutionError,
        decision: RetryDecision,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let job = find_mut(&mut jobs, id)?;
        require_status(job, JobStatus::Processing)?;

        job.error = Some(error.to_string());

        match decision {
            RetryDecision::RetryAfter(delay) if !error.is_permanent() => {
                let delay = chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::days(1));
                job.status = JobStatus::Pending;
                job.next_retry_at = Some(now + delay);
            }
            _ => {
                job.status = JobStatus::Failed;
                job.next_retry_at = None;
                job.completed_at = Some(now);
            }
        }

        Ok(job.clone())
    }

    /// Remove a pending job. Processing and terminal jobs cannot be cancelled.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: JobId) -> Result<Job, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let index = jobs
            .iter()
            .position(|job| job.id == id)
            .ok_or(QueueError::JobNotFound(id))?;

        let status = jobs[index].status;
        if status != JobStatus::Pending {
            warn!(job_id = %id, %status, "Refusing to cancel non-pending job");
            return Err(QueueError::InvalidState { job_id: id, status });
        }

        let job = jobs.remove(index);
        info!(job_id = %id, job_type = %job.job_type(), "Job cancelled");
        Ok(job)
    }

    pub async fn get(&self, id: JobId) -> Option<Job> {
        self.jobs.lock().await.iter().find(|job| job.id == id).cloned()
    }

    /// Most recently created jobs first
    pub async fn recent(&self, limit: usize) -> Vec<Job> {
        let mut jobs = self.jobs.lock().await.clone();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        jobs
    }

    /// Jobs in dequeue order (priority, then arrival)
    pub async fn snapshot(&self) -> Vec<Job> {
        self.jobs.lock().await.clone()
    }

    pub async fn counts(&self) -> QueueCounts {
        let jobs = self.jobs.lock().await;
        let mut counts = QueueCounts {
            total: jobs.len(),
            ..QueueCounts::default()
        };
        for job in jobs.iter() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }

    /// Earliest backoff deadline among pending jobs still waiting to retry
    pub async fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.jobs
            .lock()
            .await
            .iter()
            .filter(|job| job.status == JobStatus::Pending)
            .filter_map(|job| job.next_retry_at)
            .min()
    }

    /// Trim the collection according to the retention policy
    pub async fn apply_retention(&self, now: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.lock().await;
        let removed = self.retention.apply(&mut jobs, now);
        if removed > 0 {
            debug!(removed, remaining = jobs.len(), "Retention policy trimmed jobs");
        }
        removed
    }
}

fn find_mut(jobs: &mut [Job], id: JobId) -> Result<&mut Job, QueueError> {
    jobs.iter_mut()
        .find(|job| job.id == id)
        .ok_or(QueueError::JobNotFound(id))
}

fn require_status(job: &Job, expected: JobStatus) -> Result<(), QueueError> {
    if job.status == expected {
        Ok(())
    } else {
        Err(QueueError::InvalidState {
            job_id: job.id,
            status: job.status,
        })
    }
}
