//! Bounded retry with exponential backoff.
//!
//! - 4xx (except 429): fail fast, error returned as-is
//! - 429: wait for the provider hint (or the default) and try again
//! - network / 5xx: exponential backoff capped at `max_delay`
//! - calls slower than `slow_call_threshold` are logged but still succeed

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use super::error::ApiError;
use crate::config::env_or;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Wait used for a 429 without a `retry-after` header.
    pub default_rate_limit_wait: Duration,
    pub slow_call_threshold: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            default_rate_limit_wait: Duration::from_secs(60),
            slow_call_threshold: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_attempts: env_or("RETRY_MAX_ATTEMPTS", d.max_attempts).max(1),
            base_delay: Duration::from_millis(env_or(
                "RETRY_BASE_DELAY_MS",
                d.base_delay.as_millis() as u64,
            )),
            max_delay: Duration::from_millis(env_or(
                "RETRY_MAX_DELAY_MS",
                d.max_delay.as_millis() as u64,
            )),
            default_rate_limit_wait: Duration::from_secs(env_or(
                "RATE_LIMIT_DEFAULT_WAIT_SECS",
                d.default_rate_limit_wait.as_secs(),
            )),
            slow_call_threshold: Duration::from_millis(env_or(
                "SLOW_CALL_MS",
                d.slow_call_threshold.as_millis() as u64,
            )),
        }
    }
}

/// What one `execute` run cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallStats {
    pub attempts: u32,
    pub rate_limited: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.policy
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.policy.max_delay)
    }

    pub async fn execute<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, ApiError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        self.execute_with_stats(operation, call)
            .await
            .map(|(value, _)| value)
    }

    /// Run `call` until it succeeds, fails fast, or attempts run out.
    ///
    /// `call` receives the 1-based attempt number.
    pub async fn execute_with_stats<T, F, Fut>(
        &self,
        operation: &str,
        mut call: F,
    ) -> Result<(T, CallStats), ApiError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let started = Instant::now();
        let mut rate_limited = 0u32;
        let mut last_error: Option<ApiError> = None;

        for attempt in 1..=max_attempts {
            let call_started = Instant::now();

            match call(attempt).await {
                Ok(value) => {
                    let took = call_started.elapsed();
                    if took >= self.policy.slow_call_threshold {
                        warn!(
                            operation,
                            attempt,
                            elapsed_ms = took.as_millis() as u64,
                            "Slow provider call"
                        );
                        metrics::increment_counter!(
                            "provider_slow_calls_total",
                            "operation" => operation.to_string()
                        );
                    }
                    let stats = CallStats {
                        attempts: attempt,
                        rate_limited,
                        elapsed: started.elapsed(),
                    };
                    return Ok((value, stats));
                }
                Err(ApiError::RateLimited { retry_after }) => {
                    rate_limited += 1;
                    metrics::increment_counter!(
                        "provider_rate_limited_total",
                        "operation" => operation.to_string()
                    );
                    let wait = retry_after.unwrap_or(self.policy.default_rate_limit_wait);
                    if attempt < max_attempts {
                        warn!(
                            operation,
                            attempt,
                            wait_ms = wait.as_millis() as u64,
                            "Rate limited, waiting before retry"
                        );
                        sleep(wait).await;
                    }
                }
                Err(e) if !e.is_retryable() => {
                    debug!(operation, attempt, error = %e, "Non-retryable provider error");
                    return Err(e);
                }
                Err(e) => {
                    metrics::increment_counter!(
                        "provider_retries_total",
                        "operation" => operation.to_string()
                    );
                    if attempt < max_attempts {
                        let delay = self.backoff_delay(attempt);
                        warn!(
                            operation,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Provider call failed, retrying"
                        );
                        sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        // Rate-limited attempts are not counted as failures in the exhaustion error.
        let failures = max_attempts - rate_limited;
        let err = match last_error {
            Some(last) => ApiError::Exhausted {
                attempts: failures,
                last: Box::new(last),
            },
            None => ApiError::RateLimitExhausted {
                attempts: max_attempts,
            },
        };
        warn!(operation, error = %err, "Provider call gave up");
        Err(err)
    }
}
