// Error handling framework for the job engine

use thiserror::Error;

use crate::models::{JobId, JobStatus};

/// Validation errors: malformed input rejected before any state changes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },
}

/// Job queue errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job {job_id} cannot be changed while {status}")]
    InvalidState { job_id: JobId, status: JobStatus },
}

/// Job execution errors, captured per attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Handler for '{job_type}' failed: {message}")]
    HandlerFailed { job_type: String, message: String },

    #[error("Handler for '{job_type}' panicked: {message}")]
    HandlerPanicked { job_type: String, message: String },

    #[error("No handler registered for job type '{0}'")]
    UnregisteredType(String),
}

impl ExecutionError {
    /// Failures that must not consume retries
    pub fn is_permanent(&self) -> bool {
        matches!(self, ExecutionError::UnregisteredType(_))
    }
}

/// Schedule-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Schedule not found: {0}")]
    ScheduleNotFound(String),

    #[error("No next execution time available for schedule '{0}'")]
    NoNextExecution(String),

    #[error("Failed to enqueue job for schedule '{name}': {reason}")]
    Publish { name: String, reason: String },
}

/// Umbrella error for the engine control surface
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

impl From<ValidationError> for EngineError {
    fn from(err: ValidationError) -> Self {
        EngineError::Queue(QueueError::Validation(err))
    }
}

impl EngineError {
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::Queue(QueueError::Validation(_))
                | EngineError::Schedule(ScheduleError::Validation(_))
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::Queue(QueueError::JobNotFound(_))
                | EngineError::Schedule(ScheduleError::ScheduleNotFound(_))
        )
    }
}
