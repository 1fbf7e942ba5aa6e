//! NF-050: Retry with exponential backoff for transient remote errors.

use super::RemoteError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// How often and how patiently a transient failure is retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 200,
            max_backoff_ms: 5000,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay before attempt `attempt + 1` (attempts are 1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Run `op` until it succeeds, fails non-transiently, or attempts run out.
///
/// Exhausting the budget on transient errors escalates to `Fatal`.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(RemoteError::Transient(message)) => {
                if attempt >= attempts {
                    return Err(RemoteError::Fatal {
                        status: None,
                        message: format!("{} failed after {} attempt(s): {}", what, attempt, message),
                    });
                }
                let delay = policy.backoff(attempt);
                warn!(
                    operation = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient error, retrying: {}",
                    message
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[test]
    fn test_nf050_backoff_doubles_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(2), Duration::from_millis(400));
        assert_eq!(p.backoff(3), Duration::from_millis(800));
        assert_eq!(p.backoff(10), Duration::from_millis(5000));
        assert_eq!(p.backoff(100), Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn test_nf050_transient_then_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_retry(&fast(4), "create", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RemoteError::Transient("HTTP 503".into()))
            } else {
                Ok("br-1")
            }
        })
        .await;
        assert_eq!(result, Ok("br-1"));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_nf050_exhaustion_escalates_to_fatal() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = with_retry(&fast(3), "update", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::Transient("HTTP 429".into()))
        })
        .await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        match result {
            Err(RemoteError::Fatal { status, message }) => {
                assert_eq!(status, None);
                assert!(message.contains("after 3 attempt(s)"));
                assert!(message.contains("HTTP 429"));
            }
            other => panic!("expected fatal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nf050_fatal_and_not_found_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = with_retry(&fast(5), "read", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::NotFound)
        })
        .await;
        assert_eq!(result, Err(RemoteError::NotFound));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_nf050_zero_attempts_means_one() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy {
            max_attempts: 0,
            ..fast(0)
        };
        let _ = with_retry(&policy, "delete", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(RemoteError::Transient("reset".into()))
        })
        .await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
