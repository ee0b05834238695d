//! Bounded exponential backoff used by the store gateway when a
//! `StoreError` is retryable, before it is allowed to surface as
//! `STORE_UNAVAILABLE` to the caller.

use std::time;

use crate::error::StoreError;

#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
    /// The maximum number of attempts before giving up entirely.
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
        max_attempts: u32,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            max_attempts,
        }
    }

    /// Calculate the time until the next retry attempt.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self.initial_interval * self.backoff_coefficient.pow(attempt);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }

    /// Whether a caller that has already attempted `attempt` times may
    /// still retry once more.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `operation` until it succeeds, returns a non-retryable error, or
    /// exhausts this policy's attempt budget, sleeping the backoff interval
    /// between attempts. This is the gate a `StoreError` passes through
    /// before it is allowed to surface as `STORE_UNAVAILABLE`.
    pub async fn retry<T, Fut>(&self, mut operation: impl FnMut() -> Fut) -> Result<T, StoreError>
    where
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && self.should_retry(attempt) => {
                    tokio::time::sleep(self.time_until_next_retry(attempt)).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(100),
            maximum_interval: Some(time::Duration::from_secs(5)),
            max_attempts: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::new(
            2,
            time::Duration::from_millis(100),
            Some(time::Duration::from_secs(1)),
            3,
        );

        assert_eq!(policy.time_until_next_retry(0), time::Duration::from_millis(100));
        assert_eq!(policy.time_until_next_retry(1), time::Duration::from_millis(200));
        assert_eq!(policy.time_until_next_retry(10), time::Duration::from_secs(1));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::new(2, time::Duration::from_millis(10), None, 3);

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(2, time::Duration::from_millis(1), None, 5);
        let attempts = std::sync::atomic::AtomicU32::new(0);

        let result: Result<i32, StoreError> = policy
            .retry(|| async {
                let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n < 2 {
                    Err(StoreError::ConnectionError {
                        error: sqlx::Error::PoolClosed,
                    })
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_immediately_on_non_retryable_error() {
        let policy = RetryPolicy::default();
        let attempts = std::sync::atomic::AtomicU32::new(0);

        let result: Result<i32, StoreError> = policy
            .retry(|| async {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(StoreError::QueryError {
                    command: "SELECT".to_owned(),
                    error: sqlx::Error::RowNotFound,
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
