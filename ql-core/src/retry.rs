//! Bounded retry with fixed backoff.
//!
//! One combinator shared by store operations and lock acquisition. The caller
//! decides which failures are worth another attempt; everything else returns
//! immediately.

use serde::Deserialize;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }
}

/// Runs `op` until it succeeds, returns a non-retryable error, or the policy's
/// attempts are used up. `op` receives the 1-based attempt number. The last
/// error is returned on exhaustion.
pub async fn retry<T, E, F, Fut, P>(
    policy: RetryPolicy,
    op_name: &'static str,
    mut op: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let attempts = policy.max_attempts();
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && should_retry(&e) => {
                tracing::debug!(
                    op = op_name,
                    attempt,
                    attempts,
                    error = %e,
                    "attempt failed; retrying after fixed delay"
                );
                tokio::time::sleep(policy.delay()).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 1 {
                    tracing::debug!(op = op_name, attempt, error = %e, "giving up after retries");
                }
                return Err(e);
            }
        }
    }
}
