use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::ValidationError;

/// Upper bound accepted for `max_attempts` on a single job
pub const MAX_ATTEMPTS_CEILING: u32 = 100;

/// Attempts granted to a job when the caller does not specify any
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

// ============================================================================
// Job Models
// ============================================================================

/// Opaque job identifier, assigned once at enqueue time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ValidationError::InvalidFieldValue {
                field: "job_id".to_string(),
                reason: e.to_string(),
            })
    }
}

/// Priority tier of a job. Higher tiers are always dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    High,
    Medium,
    Low,
}

impl JobPriority {
    /// Numeric weight used for queue ordering (high=3, medium=2, low=1)
    pub fn weight(self) -> u8 {
        match self {
            JobPriority::High => 3,
            JobPriority::Medium => 2,
            JobPriority::Low => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobPriority::High => "high",
            JobPriority::Medium => "medium",
            JobPriority::Low => "low",
        }
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Medium
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(JobPriority::High),
            "medium" => Ok(JobPriority::Medium),
            "low" => Ok(JobPriority::Low),
            other => Err(ValidationError::InvalidFieldValue {
                field: "priority".to_string(),
                reason: format!("unknown priority '{}'", other),
            }),
        }
    }
}

/// Lifecycle status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Completed and failed jobs never transition again
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work description carried by a job, keyed by job type.
///
/// The variant decides which registered handler receives the job. Host
/// applications that need types outside the built-in set use `Custom`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobPayload {
    ProcessCommits {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repository: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<DateTime<Utc>>,
    },
    HealthCheck,
    Backup {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination: Option<String>,
    },
    Cleanup {
        older_than_days: u32,
    },
    Custom {
        job_type: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl JobPayload {
    pub const PROCESS_COMMITS: &'static str = "process-commits";
    pub const HEALTH_CHECK: &'static str = "health-check";
    pub const BACKUP: &'static str = "backup";
    pub const CLEANUP: &'static str = "cleanup";

    /// Dispatch key used to look up the handler for this payload
    pub fn job_type(&self) -> &str {
        match self {
            JobPayload::ProcessCommits { .. } => Self::PROCESS_COMMITS,
            JobPayload::HealthCheck => Self::HEALTH_CHECK,
            JobPayload::Backup { .. } => Self::BACKUP,
            JobPayload::Cleanup { .. } => Self::CLEANUP,
            JobPayload::Custom { job_type, .. } => job_type,
        }
    }

    /// Build a custom payload for a host-defined job type
    pub fn custom(job_type: impl Into<String>, data: serde_json::Value) -> Self {
        JobPayload::Custom {
            job_type: job_type.into(),
            data,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            JobPayload::Custom { job_type, .. } if job_type.trim().is_empty() => {
                Err(ValidationError::MissingField("job_type".to_string()))
            }
            JobPayload::Cleanup { older_than_days } if *older_than_days == 0 => {
                Err(ValidationError::InvalidFieldValue {
                    field: "older_than_days".to_string(),
                    reason: "must be at least 1".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Job represents one unit of schedulable, retryable work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub priority: JobPriority,
    pub payload: JobPayload,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a fresh pending job from an enqueue request
    pub fn new(request: EnqueueRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            priority: request.priority,
            payload: request.payload,
            created_at,
            attempts: 0,
            max_attempts: request.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            next_retry_at: None,
            status: JobStatus::Pending,
            error: None,
            result: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn job_type(&self) -> &str {
        self.payload.job_type()
    }

    /// A pending job whose backoff wait (if any) has elapsed
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_retry_at.map_or(true, |at| at <= now)
    }
}

/// Parameters for creating a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub payload: JobPayload,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl EnqueueRequest {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            payload,
            priority: JobPriority::default(),
            max_attempts: None,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Reject malformed parameters before anything is enqueued
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.payload.validate()?;

        if let Some(max_attempts) = self.max_attempts {
            if max_attempts == 0 || max_attempts > MAX_ATTEMPTS_CEILING {
                return Err(ValidationError::InvalidFieldValue {
                    field: "max_attempts".to_string(),
                    reason: format!(
                        "must be between 1 and {}, got {}",
                        MAX_ATTEMPTS_CEILING, max_attempts
                    ),
                });
            }
        }

        Ok(())
    }
}

/// Snapshot of job counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

// ============================================================================
// Schedule Models
// ============================================================================

/// A named recurring trigger that creates jobs of a fixed type and priority
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub name: String,
    pub cron_expression: String,
    pub payload: JobPayload,
    pub priority: JobPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    /// Disabled schedules are never armed
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Whether the schedule's timer is currently armed
    #[serde(default)]
    pub active: bool,
}

fn default_enabled() -> bool {
    true
}

impl Schedule {
    pub fn new(
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        payload: JobPayload,
        priority: JobPriority,
    ) -> Self {
        Self {
            name: name.into(),
            cron_expression: cron_expression.into(),
            payload,
            priority,
            last_run: None,
            enabled: true,
            active: false,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn job_type(&self) -> &str {
        self.payload.job_type()
    }

    /// The job request produced by one firing of this schedule
    pub fn enqueue_request(&self) -> EnqueueRequest {
        EnqueueRequest::new(self.payload.clone()).with_priority(self.priority)
    }
}

/// Operator-facing view of one schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStatus {
    pub name: String,
    pub cron_expression: String,
    pub job_type: String,
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}
