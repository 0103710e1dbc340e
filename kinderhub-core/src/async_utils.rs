//! Retry and timeout helpers for calls to the Kinderhub API

use crate::config::RefreshPolicy;
use crate::error::{ErrorContext, KinderhubError, KinderhubResult};
use std::future::Future;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, warn};

/// Backoff schedule for `retry_async`
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: usize,
    /// Initial delay between retries in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
    /// Backoff multiplier (exponential backoff)
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A config that runs the operation exactly once
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

impl From<&RefreshPolicy> for RetryConfig {
    fn from(policy: &RefreshPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts.max(1),
            initial_delay_ms: policy.initial_delay_ms,
            // Profile refresh blocks the UI in Hydrating; keep waits short
            max_delay_ms: 5_000,
            ..Default::default()
        }
    }
}

impl RetryConfig {
    /// Wait before retry number `retry` (1-based), capped and optionally jittered by ±10%
    pub fn delay_for(&self, retry: usize) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let base = (self.initial_delay_ms as f64) * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay_ms as f64);
        let spread = if self.jitter {
            1.0 + (fastrand::f64() - 0.5) * 0.2
        } else {
            1.0
        };
        Duration::from_millis((capped * spread) as u64)
    }
}

/// Run `operation` until it succeeds or `config.max_attempts` calls have failed
///
/// The last error is returned unchanged.
pub async fn retry_async<F, Fut, T, E>(
    operation: F,
    config: RetryConfig,
    operation_name: &str,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_async_if(operation, config, operation_name, |_| true).await
}

/// Like [`retry_async`], but gives up at once when `should_retry` rejects an error
pub async fn retry_async_if<F, Fut, T, E, P>(
    mut operation: F,
    config: RetryConfig,
    operation_name: &str,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let attempts = config.max_attempts.max(1);

    for attempt in 1..attempts {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(op = operation_name, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !should_retry(&e) => {
                debug!(op = operation_name, attempt, error = %e, "Error is not retryable");
                return Err(e);
            }
            Err(e) => {
                let wait = config.delay_for(attempt);
                warn!(
                    op = operation_name,
                    attempt,
                    attempts,
                    error = %e,
                    wait_ms = wait.as_millis() as u64,
                    "Attempt failed, retrying"
                );
                sleep(wait).await;
            }
        }
    }

    // Final attempt
    operation().await.inspect_err(|e| {
        if attempts > 1 {
            error!(
                op = operation_name,
                attempts,
                error = %e,
                "Giving up after all attempts"
            );
        }
    })
}

/// Fail with `KinderhubError::Timeout` if `future` has not finished in time
pub async fn with_timeout<F, T>(
    future: F,
    timeout_ms: u64,
    operation_name: &str,
) -> KinderhubResult<T>
where
    F: Future<Output = T>,
{
    match timeout(Duration::from_millis(timeout_ms), future).await {
        Ok(result) => Ok(result),
        Err(_) => Err(KinderhubError::Timeout {
            operation: operation_name.to_string(),
            duration_ms: timeout_ms,
            context: ErrorContext::new("async_utils")
                .with_operation(operation_name)
                .with_suggestion("Check that the Kinderhub API is reachable")
                .with_suggestion("Raise api.timeout_seconds in the configuration"),
        }),
    }
}
