//! Retry wrapper for coordinator calls.

use std::future::Future;
use std::time::Duration;

use tierlink_core::StatusError;
use tracing::warn;

/// How often and how patiently a call is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound on any delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay after the given failed attempt (1-based): doubles each time,
    /// capped at `max_backoff`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(multiplier)
            .min(self.max_backoff)
    }
}

/// Runs `operation` until it succeeds, fails permanently or runs out of
/// attempts.
///
/// Only `Unavailable` failures are retried. On exhaustion the result is an
/// `Unavailable` carrying the last cause.
pub async fn retry_rpc<T, F, Fut>(
    policy: &RetryPolicy,
    description: &str,
    mut operation: F,
) -> Result<T, StatusError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StatusError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };

        if attempt >= max_attempts {
            return Err(StatusError::Unavailable(format!(
                "{description} failed after {attempt} attempts: {error}"
            )));
        }

        let delay = policy.backoff(attempt);
        warn!(
            operation = description,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis(),
            error = %error,
            "retrying after transient failure"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1_000),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let calls = &AtomicU32::new(0);
        let result = retry_rpc(&fast(5), "commit_block", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StatusError::Unavailable("coordinator restarting".into()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_propagate_immediately() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = retry_rpc(&fast(5), "commit_block", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StatusError::InvalidArgument("negative length".into()))
        })
        .await;
        assert_eq!(
            result.unwrap_err(),
            StatusError::InvalidArgument("negative length".into())
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_is_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = retry_rpc(&fast(5), "heartbeat", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StatusError::Cancelled("interrupted".into()))
        })
        .await;
        assert!(matches!(result, Err(StatusError::Cancelled(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_carries_last_cause() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = retry_rpc(&fast(3), "heartbeat", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err(StatusError::Unavailable(format!("refused #{n}")))
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(StatusError::Unavailable(message)) => {
                assert!(message.contains("after 3 attempts"), "{message}");
                assert!(message.contains("refused #2"), "{message}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_attempt_policy() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = retry_rpc(&RetryPolicy::once(), "heartbeat", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StatusError::Unavailable("down".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
