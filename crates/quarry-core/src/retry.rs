//! Bounded retry with exponential backoff
//!
//! Shared by the tool layer and the agent layer so both apply the same policy:
//! a fixed attempt cap, exponential delays capped at a maximum, and retries only
//! for errors the caller classifies as retryable.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::Result;

/// Hard ceiling on total attempts, whatever the configuration asks for
pub const MAX_ATTEMPTS: u32 = 3;
const DEFAULT_MAX_ATTEMPTS: u32 = MAX_ATTEMPTS;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Attempt cap and backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// `max_attempts` is clamped to `1..=MAX_ATTEMPTS`
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.clamp(1, MAX_ATTEMPTS),
            initial_backoff,
            max_backoff,
        }
    }

    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Copy of this policy with the attempt cap lowered to `limit` (never raised)
    pub fn capped(mut self, limit: u32) -> Self {
        self.max_attempts = self.max_attempts.min(limit.max(1));
        self
    }

    /// Delay before the attempt following `attempt` (1-indexed): initial * 2^(attempt-1)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_ATTEMPTS,
            DEFAULT_INITIAL_BACKOFF,
            DEFAULT_MAX_BACKOFF,
        )
    }
}

/// Successful value plus the number of attempts it took
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub attempts: u32,
}

impl<T> RetryOutcome<T> {
    /// Retries performed before success
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Run `op` under `policy`, retrying only errors for which `is_retryable` holds
///
/// Non-retryable errors return on first occurrence. After the attempt cap is
/// reached the last error is returned.
///
/// ```no_run
/// use quarry_core::retry::{with_retry, RetryPolicy};
/// use quarry_core::{QuarryError, Result};
///
/// async fn fetch() -> Result<String> {
///     Ok("data".to_string())
/// }
///
/// async fn example() -> Result<String> {
///     let outcome = with_retry("fetch", &RetryPolicy::default(), QuarryError::is_transient, || fetch()).await?;
///     Ok(outcome.value)
/// }
/// ```
pub async fn with_retry<T, F, Fut, P>(
    operation_name: &str,
    policy: &RetryPolicy,
    is_retryable: P,
    mut op: F,
) -> Result<RetryOutcome<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&crate::QuarryError) -> bool,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => {
                return Ok(RetryOutcome {
                    value,
                    attempts: attempt,
                })
            }
            Err(e) if attempt < policy.max_attempts && is_retryable(&e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "{} failed with transient error, retrying: {}",
                    operation_name,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 1 {
                    warn!(
                        operation = operation_name,
                        attempts = attempt,
                        "{} gave up: {}",
                        operation_name,
                        e
                    );
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QuarryError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[test]
    fn test_attempts_clamped_to_ceiling() {
        let policy = RetryPolicy::new(8, Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(policy.max_attempts, MAX_ATTEMPTS);
        let policy = RetryPolicy::new(0, Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(policy.max_attempts, 1);
    }

    #[test]
    fn test_capped_never_raises() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.capped(5).max_attempts, 3);
        assert_eq!(policy.capped(2).max_attempts, 2);
        assert_eq!(policy.capped(0).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let outcome = with_retry("op", &fast_policy(), QuarryError::is_transient, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(QuarryError::Network("reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(outcome.value, 42);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.retries(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<RetryOutcome<()>> =
            with_retry("op", &fast_policy(), QuarryError::is_transient, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(QuarryError::Timeout("slow".into())) }
            })
            .await;

        assert!(matches!(result, Err(QuarryError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<RetryOutcome<()>> =
            with_retry("op", &fast_policy(), QuarryError::is_transient, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(QuarryError::Other("bad input".into())) }
            })
            .await;

        assert!(matches!(result, Err(QuarryError::Other(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
