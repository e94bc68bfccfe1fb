//! Bounded retry loop with interruptible backoff.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::RetryPolicy;
use crate::cancellation::CancellationToken;
use crate::errors::{BuildError, Classify};

/// Predicate deciding whether an error is worth another attempt.
pub type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Why a retried operation gave up.
#[derive(Debug, Clone, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempt(s): {error}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// The last error.
        error: E,
    },

    /// An attempt failed with an error the predicate rejected.
    #[error("non-retryable error on attempt {attempts}: {error}")]
    Rejected {
        /// Attempts made.
        attempts: u32,
        /// The rejected error.
        error: E,
    },

    /// The token fired while an attempt or a backoff sleep was pending.
    #[error("cancelled after {attempts} attempt(s): {reason}")]
    Cancelled {
        /// Attempts completed.
        attempts: u32,
        /// The cancellation reason.
        reason: String,
        /// The last operation error, if any attempt had failed.
        last: Option<E>,
    },
}

impl<E> RetryError<E> {
    /// Recovers the last operation error, if there was one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Exhausted { error, .. } | Self::Rejected { error, .. } => Some(error),
            Self::Cancelled { last, .. } => last,
        }
    }

    /// Returns the number of attempts made.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::Rejected { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// Returns true if the loop stopped because of cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl<E: Into<BuildError>> From<RetryError<E>> for BuildError {
    fn from(err: RetryError<E>) -> Self {
        match err {
            RetryError::Exhausted { attempts, error } => Self::RetryExhausted {
                attempts,
                source: Box::new(error.into()),
            },
            RetryError::Rejected { error, .. } => error.into(),
            RetryError::Cancelled { reason, .. } => Self::Cancelled { reason },
        }
    }
}

/// Runs an operation under a [`RetryPolicy`].
///
/// The operation is invoked at most `max_attempts` times. Between attempts
/// the retrier sleeps `policy.delay(attempt)` (jittered if configured), and
/// the sleep ends early when the token fires. There is no sleep after the
/// final attempt.
pub struct Retrier<E> {
    policy: RetryPolicy,
    predicate: RetryPredicate<E>,
}

impl<E> Clone for Retrier<E> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy,
            predicate: Arc::clone(&self.predicate),
        }
    }
}

impl<E> fmt::Debug for Retrier<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retrier")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<E> Retrier<E> {
    /// Creates a retrier with a custom predicate.
    pub fn new<P>(policy: RetryPolicy, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self {
            policy,
            predicate: Arc::new(predicate),
        }
    }

    /// Creates a retrier that never retries.
    #[must_use]
    pub fn never(policy: RetryPolicy) -> Self
    where
        E: 'static,
    {
        Self::new(policy, |_| false)
    }

    /// Returns the policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Replaces the policy, keeping the predicate.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Runs `operation` until it succeeds, the predicate rejects an error,
    /// attempts run out, or the token fires.
    ///
    /// # Errors
    ///
    /// Returns a `RetryError` describing why the loop stopped.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last: Option<E> = None;
        let mut attempt: u32 = 0;

        loop {
            let result = match cancel.guard(operation()).await {
                Ok(result) => result,
                Err(cancelled) => {
                    return Err(RetryError::Cancelled {
                        attempts: attempt,
                        reason: cancelled.reason,
                        last,
                    })
                }
            };
            attempt += 1;

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !(self.predicate)(&error) {
                debug!(attempt, error = %error, "Error is not retryable");
                return Err(RetryError::Rejected {
                    attempts: attempt,
                    error,
                });
            }

            if attempt >= max_attempts {
                debug!(attempt, error = %error, "Retry attempts exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    error,
                });
            }

            let delay = self.policy.jittered_delay(attempt);
            debug!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Retrying after error"
            );
            last = Some(error);

            if let Err(cancelled) = cancel.sleep(delay).await {
                return Err(RetryError::Cancelled {
                    attempts: attempt,
                    reason: cancelled.reason,
                    last,
                });
            }
        }
    }
}

impl<E: Classify + 'static> Retrier<E> {
    /// Creates a retrier that retries errors whose class is retryable.
    #[must_use]
    pub fn classified(policy: RetryPolicy) -> Self {
        Self::new(policy, |err: &E| err.is_retryable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorClass;
    use crate::provider::ProviderError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(max_attempts)
            .with_initial_delay_ms(10)
            .with_max_delay_ms(40)
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_respects_call_bound_and_delay_sum() {
        let policy = fast_policy(5);
        let retrier: Retrier<ProviderError> = Retrier::classified(policy);
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let start = tokio::time::Instant::now();
        let result: Result<(), _> = retrier
            .run(&cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::throttled("RequestLimitExceeded"))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 5, .. }));
        // 10 + 20 + 40 + 40, no sleep after the last attempt
        assert_eq!(start.elapsed(), policy.total_delay());
        assert_eq!(policy.total_delay(), Duration::from_millis(110));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let retrier: Retrier<ProviderError> = Retrier::classified(fast_policy(5));
        let calls = AtomicU32::new(0);

        let value = retrier
            .run(&CancellationToken::new(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::not_found("InvalidAMIID.NotFound", "not yet"))
                } else {
                    Ok("ami-123")
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "ami-123");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let retrier: Retrier<ProviderError> = Retrier::classified(fast_policy(5));
        let calls = AtomicU32::new(0);

        let err = retrier
            .run(&CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProviderError::fatal("UnauthorizedOperation", "denied"))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, RetryError::Rejected { attempts: 1, .. }));
        assert_eq!(err.into_inner().unwrap().class, ErrorClass::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_sleep_returns_promptly() {
        let policy = RetryPolicy::new()
            .with_initial_delay_ms(60_000)
            .with_max_delay_ms(60_000);
        let retrier: Retrier<ProviderError> = Retrier::classified(policy);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            canceller.cancel("user interrupt");
        });

        let start = tokio::time::Instant::now();
        let err = retrier
            .run(&cancel, || async {
                Err::<(), _>(ProviderError::transient("InternalError", "try later"))
            })
            .await
            .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(1));
        match err {
            RetryError::Cancelled {
                attempts,
                reason,
                last,
            } => {
                assert_eq!(attempts, 1);
                assert_eq!(reason, "user interrupt");
                assert!(last.is_some());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_already_cancelled_makes_no_attempt() {
        let retrier: Retrier<ProviderError> = Retrier::classified(fast_policy(3));
        let cancel = CancellationToken::new();
        cancel.cancel("stop");
        let calls = AtomicU32::new(0);

        let err = retrier
            .run(&cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ProviderError>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(err.attempts(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_custom_predicate() {
        let retrier: Retrier<String> =
            Retrier::new(fast_policy(3), |err: &String| err.contains("again"));

        let err = retrier
            .run(&CancellationToken::new(), || async {
                Err::<(), _>("stop".to_string())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::Rejected { .. }));
    }

    #[test]
    fn test_into_build_error() {
        let exhausted: RetryError<ProviderError> = RetryError::Exhausted {
            attempts: 4,
            error: ProviderError::throttled("slow"),
        };
        assert!(matches!(
            BuildError::from(exhausted),
            BuildError::RetryExhausted { attempts: 4, .. }
        ));

        let cancelled: RetryError<ProviderError> = RetryError::Cancelled {
            attempts: 1,
            reason: "bye".into(),
            last: None,
        };
        assert!(BuildError::from(cancelled).is_cancelled());

        let rejected: RetryError<ProviderError> = RetryError::Rejected {
            attempts: 1,
            error: ProviderError::fatal("Bad", "bad"),
        };
        assert!(matches!(BuildError::from(rejected), BuildError::Provider(_)));
    }
}
