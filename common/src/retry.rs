// Retry policy with exponential backoff
//
// Delay after the n-th failed attempt is `base * 2^(n-1)`: 60s, 120s, 240s, ...
// with the default one-minute base, capped at `max_delay`.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Retry strategy trait for calculating retry delays
pub trait RetryStrategy: Send + Sync {
    /// Delay before the next attempt, given how many attempts have failed so far
    fn next_delay(&self, failed_attempts: u32) -> Duration;
}

/// Exponential backoff retry strategy with optional jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Base delay in seconds (default: 60)
    base_delay_secs: u64,
    /// Maximum delay in seconds (default: 86400 = 1 day)
    max_delay_secs: u64,
    /// Jitter factor (0.0 to 1.0, default: 0.0 = deterministic)
    jitter_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay_secs: 60,
            max_delay_secs: 86_400,
            jitter_factor: 0.0,
        }
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new exponential backoff strategy with custom values
    pub fn with_config(base_delay_secs: u64, max_delay_secs: u64, jitter_factor: f64) -> Self {
        Self {
            base_delay_secs,
            max_delay_secs: max_delay_secs.max(base_delay_secs),
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Exponential delay without jitter
    fn calculate_base_delay(&self, failed_attempts: u32) -> u64 {
        let exponent = failed_attempts.saturating_sub(1).min(32);
        self.base_delay_secs
            .saturating_mul(2_u64.saturating_pow(exponent))
            .min(self.max_delay_secs)
    }

    /// Add random jitter, returning milliseconds
    fn add_jitter_ms(&self, base_delay_secs: u64) -> u64 {
        let base_delay_ms = base_delay_secs.saturating_mul(1000);
        if self.jitter_factor == 0.0 {
            return base_delay_ms;
        }

        let jitter_range_ms = (base_delay_ms as f64 * self.jitter_factor) as u64;
        let jitter_ms = if jitter_range_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_range_ms)
        } else {
            0
        };

        base_delay_ms.saturating_add(jitter_ms)
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, failed_attempts: u32) -> Duration {
        let base_delay_secs = self.calculate_base_delay(failed_attempts);
        Duration::from_millis(self.add_jitter_ms(base_delay_secs))
    }
}

/// Fixed delay retry strategy (for testing or simple cases)
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, _failed_attempts: u32) -> Duration {
        self.delay
    }
}

/// Outcome of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// No attempts left: the job becomes `failed`
    Terminal,
    /// Job stays `pending` and becomes eligible again after the delay
    RetryAfter(Duration),
}

impl RetryDecision {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryDecision::Terminal)
    }
}

/// Maps an attempt count to a continue/terminate decision
#[derive(Clone)]
pub struct RetryPolicy {
    strategy: Arc<dyn RetryStrategy>,
}

impl RetryPolicy {
    pub fn new(strategy: Arc<dyn RetryStrategy>) -> Self {
        Self { strategy }
    }

    /// `attempts` is the count after the failed attempt was recorded
    pub fn decide(&self, attempts: u32, max_attempts: u32) -> RetryDecision {
        if attempts >= max_attempts {
            RetryDecision::Terminal
        } else {
            RetryDecision::RetryAfter(self.strategy.next_delay(attempts))
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Arc::new(ExponentialBackoff::default()))
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy").finish_non_exhaustive()
    }
}
