// Configuration management with layered configuration (defaults, files, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use crate::executor::ExecutorConfig;
use crate::models::{JobPayload, JobPriority, Schedule, MAX_ATTEMPTS_CEILING};
use crate::retention::RetentionPolicy;
use crate::retry::{ExponentialBackoff, RetryPolicy};
use crate::schedule::{parse_cron_expression, parse_timezone};

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub executor: ExecutorSettings,
    pub retention: RetentionSettings,
    pub scheduler: SchedulerSettings,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub poll_interval_seconds: u64,
    pub base_retry_delay_seconds: u64,
    pub max_retry_delay_seconds: u64,
    pub jitter_factor: f64,
    pub default_max_attempts: u32,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 30,
            base_retry_delay_seconds: 60,
            max_retry_delay_seconds: 86_400,
            jitter_factor: 0.0,
            default_max_attempts: 3,
        }
    }
}

impl ExecutorSettings {
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            poll_interval_seconds: self.poll_interval_seconds,
            default_max_attempts: self.default_max_attempts,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Arc::new(ExponentialBackoff::with_config(
            self.base_retry_delay_seconds,
            self.max_retry_delay_seconds,
            self.jitter_factor,
        )))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub max_jobs: usize,
    pub completed_retention_hours: i64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            max_jobs: 100,
            completed_retention_hours: 24,
        }
    }
}

impl RetentionSettings {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy::new(
            self.max_jobs,
            chrono::Duration::hours(self.completed_retention_hours),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub timezone: String,
    pub schedules: Vec<ScheduleConfig>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            schedules: default_schedules(),
        }
    }
}

impl SchedulerSettings {
    /// Schedule models for every configured schedule, disabled ones included
    pub fn schedules(&self) -> Vec<Schedule> {
        self.schedules.iter().map(ScheduleConfig::to_schedule).collect()
    }
}

/// One configured recurring job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub name: String,
    pub cron_expression: String,
    #[serde(default)]
    pub priority: JobPriority,
    pub payload: JobPayload,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ScheduleConfig {
    pub fn new(
        name: &str,
        cron_expression: &str,
        priority: JobPriority,
        payload: JobPayload,
    ) -> Self {
        Self {
            name: name.to_string(),
            cron_expression: cron_expression.to_string(),
            priority,
            payload,
            enabled: true,
        }
    }

    pub fn to_schedule(&self) -> Schedule {
        Schedule::new(
            self.name.clone(),
            self.cron_expression.clone(),
            self.payload.clone(),
            self.priority,
        )
        .with_enabled(self.enabled)
    }
}

/// The built-in schedule set
pub fn default_schedules() -> Vec<ScheduleConfig> {
    vec![
        ScheduleConfig::new(
            "main-posting",
            "0 9 * * *",
            JobPriority::Medium,
            JobPayload::ProcessCommits {
                repository: None,
                since: None,
            },
        ),
        ScheduleConfig::new(
            "health-check",
            "*/15 * * * *",
            JobPriority::Low,
            JobPayload::HealthCheck,
        ),
        ScheduleConfig::new(
            "daily-backup",
            "0 2 * * *",
            JobPriority::Low,
            JobPayload::Backup { destination: None },
        ),
        ScheduleConfig::new(
            "weekly-cleanup",
            "0 3 * * SUN",
            JobPriority::Low,
            JobPayload::Cleanup { older_than_days: 30 },
        ),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub json_logs: bool,
    pub metrics_port: Option<u16>,
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
            metrics_port: None,
            tracing_endpoint: None,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Local overrides (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.executor.poll_interval_seconds == 0 {
            return Err("Executor poll_interval_seconds must be greater than 0".to_string());
        }
        if self.executor.base_retry_delay_seconds == 0 {
            return Err("Executor base_retry_delay_seconds must be greater than 0".to_string());
        }
        if self.executor.max_retry_delay_seconds < self.executor.base_retry_delay_seconds {
            return Err(
                "Executor max_retry_delay_seconds must not be below base_retry_delay_seconds"
                    .to_string(),
            );
        }
        if !(0.0..=1.0).contains(&self.executor.jitter_factor) {
            return Err("Executor jitter_factor must be between 0.0 and 1.0".to_string());
        }
        if self.executor.default_max_attempts == 0
            || self.executor.default_max_attempts > MAX_ATTEMPTS_CEILING
        {
            return Err(format!(
                "Executor default_max_attempts must be between 1 and {}",
                MAX_ATTEMPTS_CEILING
            ));
        }

        if self.retention.max_jobs == 0 {
            return Err("Retention max_jobs must be greater than 0".to_string());
        }
        if self.retention.completed_retention_hours <= 0 {
            return Err("Retention completed_retention_hours must be greater than 0".to_string());
        }

        parse_timezone(&self.scheduler.timezone).map_err(|e| e.to_string())?;

        let mut names = HashSet::new();
        for schedule in &self.scheduler.schedules {
            if schedule.name.trim().is_empty() {
                return Err("Schedule name cannot be empty".to_string());
            }
            if !names.insert(schedule.name.as_str()) {
                return Err(format!("Duplicate schedule name '{}'", schedule.name));
            }
            parse_cron_expression(&schedule.cron_expression)
                .map_err(|e| format!("Schedule '{}': {}", schedule.name, e))?;
            schedule
                .payload
                .validate()
                .map_err(|e| format!("Schedule '{}': {}", schedule.name, e))?;
        }

        if self.observability.metrics_port == Some(0) {
            return Err("Metrics port must be greater than 0".to_string());
        }

        Ok(())
    }
}
