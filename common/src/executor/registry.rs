// Handler registry: job type -> async handler

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::models::JobPayload;

/// Callback function type for processing a job payload
pub type JobHandler = Arc<
    dyn Fn(JobPayload) -> BoxFuture<'static, Result<serde_json::Value, anyhow::Error>>
        + Send
        + Sync,
>;

/// Lookup table from job type to the handler that processes it
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, JobHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async function as the handler for `job_type`, replacing any previous one
    pub fn register<F, Fut>(&mut self, job_type: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(JobPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, anyhow::Error>> + Send + 'static,
    {
        let handler: JobHandler = Arc::new(move |payload| handler(payload).boxed());
        self.handlers.insert(job_type.into(), handler);
        self
    }

    /// Builder-style variant of `register`
    pub fn with<F, Fut>(mut self, job_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(JobPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, anyhow::Error>> + Send + 'static,
    {
        self.register(job_type, handler);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<JobHandler> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
