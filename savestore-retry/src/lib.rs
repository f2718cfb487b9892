//! Retry and backoff for savestore storage calls
//!
//! The persistence engine surfaces backend failures as they happen. Storage
//! adapters that sit on flaky media opt into retries by running each call
//! through [`retry`] with a [`RetryPolicy`]; the error type decides what is
//! worth retrying via [`RetryableError`].

use std::fmt;
use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use thiserror::Error;
use tracing::{debug, warn};

/// Attempts allowed when a policy does not say otherwise
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;

/// Classifies an error as worth retrying or not
pub trait RetryableError {
    fn is_transient(&self) -> bool;
}

/// Backoff schedule plus a hard cap on attempts
///
/// A call stops retrying at whichever limit comes first: `max_attempts` or
/// the backoff's elapsed-time budget.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: ExponentialBackoff,
    max_attempts: usize,
}

impl RetryPolicy {
    pub fn new(backoff: ExponentialBackoff, max_attempts: usize) -> Self {
        Self {
            backoff,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Schedule for local files: 50ms doubling up to 1s, 10s budget
    pub fn local_storage() -> Self {
        Self::new(
            schedule(Duration::from_millis(50), Duration::from_secs(1), Duration::from_secs(10)),
            DEFAULT_MAX_ATTEMPTS,
        )
    }

    /// Schedule for remote stores: 100ms doubling up to 5s, 30s budget
    pub fn remote_storage() -> Self {
        Self::new(
            schedule(Duration::from_millis(100), Duration::from_secs(5), Duration::from_secs(30)),
            DEFAULT_MAX_ATTEMPTS,
        )
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::remote_storage()
    }
}

fn schedule(initial: Duration, max_interval: Duration, budget: Duration) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(initial)
        .with_max_interval(max_interval)
        .with_max_elapsed_time(Some(budget))
        .with_multiplier(2.0)
        .build()
}

/// Why a retried call finally failed
#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("'{operation}' gave up after {attempts} attempts: {last}")]
    Exhausted {
        operation: &'static str,
        attempts: usize,
        last: E,
    },
    #[error("'{operation}' failed permanently: {error}")]
    Permanent { operation: &'static str, error: E },
}

impl<E> RetryError<E> {
    /// The error returned by the last attempt
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent { error, .. } => error,
        }
    }

    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Permanent { .. } => 1,
        }
    }
}

/// Run `call` until it succeeds, fails permanently or the policy runs out
///
/// `call` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(operation: &'static str, policy: &RetryPolicy, mut call: F) -> Result<T, RetryError<E>>
where
    E: RetryableError + fmt::Display,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = policy.backoff.clone();
    backoff.reset();
    let mut attempt = 1;

    loop {
        let error = match call(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "storage call recovered");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !error.is_transient() {
            debug!(operation, attempt, error = %error, "not retrying");
            return Err(RetryError::Permanent { operation, error });
        }

        let delay = match backoff.next_backoff() {
            Some(delay) if attempt < policy.max_attempts => delay,
            _ => {
                warn!(operation, attempts = attempt, error = %error, "retries exhausted");
                return Err(RetryError::Exhausted {
                    operation,
                    attempts: attempt,
                    last: error,
                });
            }
        };
        warn!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %error, "transient failure, retrying");
        drop(error);
        attempt += 1;

        #[cfg(feature = "async-rt")]
        tokio::time::sleep(delay).await;

        #[cfg(not(feature = "async-rt"))]
        std::thread::sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    enum Failure {
        Busy,
        Denied,
    }

    impl fmt::Display for Failure {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Failure::Busy => f.write_str("device busy"),
                Failure::Denied => f.write_str("permission denied"),
            }
        }
    }

    impl RetryableError for Failure {
        fn is_transient(&self) -> bool {
            matches!(self, Failure::Busy)
        }
    }

    fn fast(max_attempts: usize) -> RetryPolicy {
        RetryPolicy::new(
            schedule(Duration::from_millis(1), Duration::from_millis(2), Duration::from_secs(5)),
            max_attempts,
        )
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let result: Result<_, RetryError<Failure>> =
            retry("load", &RetryPolicy::default(), |_| async { Ok("record") }).await;
        assert_eq!(result.unwrap(), "record");
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        let result = retry("save", &fast(5), |attempt| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if attempt < 3 {
                Err(Failure::Busy)
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        let result: Result<(), _> = retry("remove", &fast(5), |_| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Failure::Denied)
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Permanent { .. }));
        assert_eq!(err.attempts(), 1);
        assert_eq!(err.into_inner(), Failure::Denied);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_cap() {
        let result: Result<(), _> = retry("save", &fast(3), |_| async { Err(Failure::Busy) }).await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.to_string(), "'save' gave up after 3 attempts: device busy");
    }

    #[test]
    fn test_policy_presets() {
        assert_eq!(RetryPolicy::local_storage().max_attempts(), DEFAULT_MAX_ATTEMPTS);
        assert_eq!(RetryPolicy::remote_storage().with_max_attempts(0).max_attempts(), 1);
    }
}
