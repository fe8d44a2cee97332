//! Bounded retry for optimistic-concurrency conflicts.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use tend_core::Result;

/// Retry policy for read-modify-write cycles against version-token stores.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Fixed backoff between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Run `operation` until it succeeds, retrying only on
/// [`tend_core::Error::Conflict`].
///
/// Each attempt must re-read the current version token itself; this
/// combinator only bounds and paces the loop. Non-conflict errors and
/// exhausted retries surface unchanged.
///
/// # Errors
///
/// Returns the operation's error once it fails with anything other than a
/// conflict, or with the final conflict once `max_attempts` is reached.
pub async fn with_conflict_retry<T, F, Fut>(
    policy: &RetryPolicy,
    subject: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1u32;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(subject, attempt, "succeeded after conflict retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_conflict() && attempt < policy.max_attempts => {
                warn!(subject, attempt, error = %e, "conflict, retrying");
                tokio::time::sleep(policy.backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use tend_core::Error;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_conflict_is_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_conflict_retry(&fast_policy(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::conflict("entry", "stale token"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_last_conflict() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_conflict_retry(&fast_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::conflict("entry", "stale token")) }
        })
        .await;

        assert!(matches!(result, Err(Error::Conflict { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_conflict_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_conflict_retry(&fast_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::render("broken template")) }
        })
        .await;

        assert!(matches!(result, Err(Error::Render { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
