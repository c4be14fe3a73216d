//! Bounded retry with exponential backoff for remote calls.

use std::future::Future;
use std::time::Duration;

use crate::errors::RemoteError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the retry that follows the zero-based `attempt`: `2^attempt * base_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// Runs an operation until it succeeds, fails fatally, or exhausts the attempt budget.
///
/// Only [`RemoteError::is_transient`] failures are retried. The last error is returned
/// unchanged once the budget is spent, so callers can still tell a timeout from a
/// rejected request.
#[derive(Clone, Copy, Debug, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn execute<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    tracing::warn!(
                        "Attempt {} of {} for {} failed: {}. Retrying in {}ms...",
                        attempt + 1,
                        max_attempts,
                        operation_name,
                        err,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Same as [`RetryExecutor::execute`], but every attempt is individually bounded by
    /// `timeout`. An attempt that overruns counts as a transient [`RemoteError::Timeout`].
    pub async fn execute_with_timeout<T, F, Fut>(
        &self,
        operation_name: &str,
        timeout: Duration,
        mut operation: F,
    ) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        self.execute(operation_name, || {
            let attempt = operation();
            async move {
                match tokio::time::timeout(timeout, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(RemoteError::Timeout {
                        operation: operation_name.to_string(),
                    }),
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn timeout() -> RemoteError {
        RemoteError::Timeout { operation: "op".into() }
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let started = Instant::now();

        let result = RetryExecutor::default()
            .execute("flaky", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(timeout())
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_error_after_budget_is_spent() {
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<(), _> = RetryExecutor::default()
            .execute("always-down", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::Server { status: Some(503), message: "unavailable".into() })
            })
            .await;

        assert!(matches!(result, Err(RemoteError::Server { status: Some(503), .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let started = Instant::now();

        let result: Result<(), _> = RetryExecutor::default()
            .execute("lookup", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::NotFound { message: "no such device".into() })
            })
            .await;

        assert!(matches!(result, Err(RemoteError::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_that_overrun_become_timeouts() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<(), _> = RetryExecutor::default()
            .execute_with_timeout("hang", Duration::from_secs(30), || {
                calls.fetch_add(1, Ordering::SeqCst);
                std::future::pending()
            })
            .await;

        assert_eq!(result, Err(RemoteError::Timeout { operation: "hang".into() }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // three 30s attempts plus 1s and 2s of backoff
        assert!(started.elapsed() >= Duration::from_secs(93));
    }
}
