//! Retry combinator for conflicting transactional writes

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// How often a conflicting unit of work is re-run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. `None` retries until success.
    pub max_attempts: Option<u32>,
    /// Pause between attempts. Zero retries immediately.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

/// Run `operation` until it succeeds, fails with an error `is_conflict`
/// rejects, or the policy runs out of attempts.
///
/// Each call to `operation` must be a complete unit of work: anything it
/// started is discarded by the time it returns an error.
pub async fn retry_on_conflict<T, E, F, Fut>(
    policy: &RetryPolicy,
    is_conflict: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if is_conflict(&e) => {
                metrics::counter!("chatwire_write_conflicts_total").increment(1);
                if !policy.allows(attempt + 1) {
                    warn!("Write still conflicting after {} attempts: {}", attempt, e);
                    return Err(e);
                }
                debug!("Write conflict on attempt {}, retrying: {}", attempt, e);
                if !policy.backoff.is_zero() {
                    tokio::time::sleep(policy.backoff).await;
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Conflict,
        Fatal,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    fn is_conflict(e: &TestError) -> bool {
        *e == TestError::Conflict
    }

    #[tokio::test]
    async fn test_retries_conflicts_until_success() {
        let calls = Cell::new(0);
        let result = retry_on_conflict(&RetryPolicy::default(), is_conflict, || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 4 {
                    Err(TestError::Conflict)
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(4));
        assert_eq!(calls.get(), 4);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry_on_conflict(&RetryPolicy::default(), is_conflict, || {
            calls.set(calls.get() + 1);
            async { Err(TestError::Fatal) }
        })
        .await;

        assert_eq!(result, Err(TestError::Fatal));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_bounded_policy_gives_up() {
        let policy = RetryPolicy {
            max_attempts: Some(3),
            backoff: Duration::from_millis(1),
        };
        let calls = Cell::new(0);
        let result: Result<(), _> = retry_on_conflict(&policy, is_conflict, || {
            calls.set(calls.get() + 1);
            async { Err(TestError::Conflict) }
        })
        .await;

        assert_eq!(result, Err(TestError::Conflict));
        assert_eq!(calls.get(), 3);
    }
}
