//! Retry policy with capped exponential backoff.
//!
//! `attempt` below always means the number of retries already performed, so
//! the first failure is evaluated with `attempt = 0` and waits `base_delay`.
//! A policy with `max_attempts = n` makes at most `n + 1` calls.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::fetch::error::{ErrorInfo, FetchError};

/// Retry budget and backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first failure.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Policy for one-off loads whose failure is shown to the user.
    pub const fn single_shot() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Policy for infinite-scroll and background fetches. A lost page there
    /// degrades quietly, so it is allowed more retries with a lower ceiling.
    pub const fn infinite_scroll() -> Self {
        Self::new(6, Duration::from_secs(1), Duration::from_secs(10))
    }

    /// Whether a failure after `attempt` retries should be retried.
    pub fn should_retry(&self, attempt: u32, error: &FetchError) -> bool {
        error.is_transient() && attempt < self.max_attempts
    }

    /// `min(base_delay * 2^attempt, max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Upper bound on total backoff time across all retries.
    pub fn worst_case_delay(&self) -> Duration {
        (0..self.max_attempts).map(|a| self.delay_for(a)).sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::single_shot()
    }
}

/// Terminal outcome of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure {
    /// Last error observed.
    pub error: FetchError,
    /// Calls made, including the first.
    pub attempts: u32,
}

impl RetryFailure {
    pub fn cancelled(attempts: u32) -> Self {
        Self {
            error: FetchError::Cancelled,
            attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.error == FetchError::Cancelled
    }

    pub fn info(&self) -> ErrorInfo {
        ErrorInfo::new(&self.error, self.attempts)
    }
}

/// Run `f` until it succeeds, fails fatally, exhausts `policy`, or `cancel`
/// fires. Cancellation is observed both during the call and during backoff.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    op_name: &str,
    mut f: F,
) -> Result<T, RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryFailure {
                error: FetchError::Cancelled,
                attempts: attempt,
            });
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            r = f() => r,
        };
        let calls = attempt + 1;

        let error = match result {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation = op_name, attempts = calls, "Fetch succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if error == FetchError::Cancelled {
            return Err(RetryFailure {
                error,
                attempts: calls,
            });
        }

        if !policy.should_retry(attempt, &error) {
            warn!(
                operation = op_name,
                attempts = calls,
                transient = error.is_transient(),
                "Fetch giving up: {error}"
            );
            return Err(RetryFailure {
                error,
                attempts: calls,
            });
        }

        let delay = policy.delay_for(attempt);
        debug!(
            operation = op_name,
            attempt = calls,
            max_attempts = policy.max_attempts + 1,
            delay_ms = delay.as_millis() as u64,
            "Fetch attempt failed: {error}"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RetryFailure {
                    error: FetchError::Cancelled,
                    attempts: calls,
                });
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
