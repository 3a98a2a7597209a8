// Job publisher seam between triggers and the job queue

use crate::errors::QueueError;
use crate::models::{EnqueueRequest, JobId};

/// JobPublisher trait for handing new jobs to the queue
#[async_trait::async_trait]
pub trait JobPublisher: Send + Sync {
    /// Enqueue a job and return its identifier
    async fn publish(&self, request: EnqueueRequest) -> Result<JobId, QueueError>;
}
