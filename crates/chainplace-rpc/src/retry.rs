//! Bounded exponential backoff for transient transport errors.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

/// Computes the delay before each retry. Holds no per-request state.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// No retries at all; the monitor loop already backs off on failures.
    pub fn none() -> Self {
        Self::new(RetryConfig {
            max_retries: 0,
            ..Default::default()
        })
    }

    /// Delay before the `attempt`-th retry (1-based), `None` once exhausted.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        let base_ms = self.config.initial_backoff.as_millis() as f64
            * self.config.multiplier.powi((attempt - 1) as i32);
        let capped = base_ms.min(self.config.max_backoff.as_millis() as f64);
        Some(Duration::from_millis(capped as u64))
    }
}
