//! Retry with exponential backoff around transient lock contention

use crate::config::PersistenceConfig;
use crate::error::{Error, Result};
use std::time::Duration;

/// Bounded exponential backoff for durable writes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&PersistenceConfig::default())
    }
}

impl From<&PersistenceConfig> for RetryPolicy {
    fn from(config: &PersistenceConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Delay slept before `attempt` (1-based; attempt 1 never waits).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op`, retrying transient failures.
    ///
    /// Any failure that survives the policy is reported as [`Error::Persistence`].
    pub fn run<T>(&self, operation: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            let delay = self.delay_before(attempt);
            if !delay.is_zero() {
                tracing::debug!(
                    operation,
                    attempt,
                    max_attempts = self.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying durable write"
                );
                std::thread::sleep(delay);
            }

            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    tracing::warn!(operation, attempt, error = %e, "Transient storage error");
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(operation, attempts = attempt, error = %e, "Durable write failed");
                    return Err(Error::Persistence {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}
