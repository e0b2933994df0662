//! Bounded retry with exponential backoff for per-window query failures.
//!
//! Only [`ReconcileError::Query`] is retried. Payload and connection errors
//! are returned immediately so the caller can degrade or abort.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{ReconcileError, Result};

/// Retry behaviour for connector queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryPolicy {
    /// Quick retry for individual queries: 3 attempts, then let the engine degrade.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            factor: default_factor(),
        }
    }

    /// Single attempt.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::query()
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            factor: 2.0,
        }
    }

    /// Reject policies whose backoff cannot be computed.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ReconcileError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(ReconcileError::Config(format!(
                "retry.factor must be a finite number of at least 1.0, got {}",
                self.factor
            )));
        }
        Ok(())
    }

    /// Delay after `delay`, capped at `max_delay_ms`.
    fn next_delay(&self, delay: Duration) -> Duration {
        let max = self.max_delay();
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.factor)
            .map_or(max, |next| next.min(max))
    }

    fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

fn default_max_attempts() -> usize {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    2_000
}

fn default_factor() -> f64 {
    2.0
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's attempts are used up. The last error is returned.
pub async fn retry<F, Fut, T>(operation_name: &str, policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = policy.initial_delay();
    let mut attempts = 0;
    let max_attempts = policy.max_attempts.max(1);

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if !err.is_retryable() || attempts >= max_attempts {
                    return Err(err);
                }

                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempts, max_attempts, err, delay
                );

                sleep(delay).await;
                delay = policy.next_delay(delay);
            }
        }
    }
}
