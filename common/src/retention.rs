// Retention policy bounding the in-memory job history

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;

use crate::models::{Job, JobStatus};

/// Default cap on retained jobs
pub const DEFAULT_MAX_JOBS: usize = 100;

/// Default age after which completed jobs may be dropped
pub const DEFAULT_COMPLETED_RETENTION_HOURS: i64 = 24;

/// Trims the job list to a bounded size.
///
/// Pending and processing jobs are never removed. When the list is over the
/// cap, jobs that completed longer ago than the retention window go first; if that is
/// not enough, the oldest terminal jobs (completed or failed) go next. The cap
/// may remain exceeded when only non-terminal jobs are left.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    max_jobs: usize,
    completed_retention: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_jobs: DEFAULT_MAX_JOBS,
            completed_retention: Duration::hours(DEFAULT_COMPLETED_RETENTION_HOURS),
        }
    }
}

impl RetentionPolicy {
    pub fn new(max_jobs: usize, completed_retention: Duration) -> Self {
        Self {
            max_jobs,
            completed_retention,
        }
    }

    /// Apply the policy in place, preserving relative order. Returns how many jobs were removed.
    pub fn apply(&self, jobs: &mut Vec<Job>, now: DateTime<Utc>) -> usize {
        let before = jobs.len();
        if before <= self.max_jobs {
            return 0;
        }

        let cutoff = now - self.completed_retention;
        jobs.retain(|job| {
            let finished_at = job.completed_at.unwrap_or(job.created_at);
            !(job.status == JobStatus::Completed && finished_at < cutoff)
        });

        let mut excess = jobs.len().saturating_sub(self.max_jobs);
        if excess > 0 {
            let mut terminal: Vec<_> = jobs
                .iter()
                .filter(|job| job.status.is_terminal())
                .map(|job| (job.created_at, job.id))
                .collect();
            terminal.sort_by_key(|(created_at, _)| *created_at);
            excess = excess.min(terminal.len());

            let doomed: HashSet<_> =
                terminal.into_iter().take(excess).map(|(_, id)| id).collect();
            jobs.retain(|job| !doomed.contains(&job.id));
        }

        before - jobs.len()
    }
}
