//! Guarded cleanup execution and reporting.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::warn;

use crate::errors::{panic_message, BuildError};

/// How a cleanup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupFailureKind {
    /// The cleanup returned an error.
    Errored,
    /// The cleanup panicked.
    Panicked,
    /// The cleanup exceeded its time budget.
    TimedOut,
}

/// A cleanup that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    /// The step whose cleanup failed.
    pub step: String,
    /// Rendered cause.
    pub message: String,
    /// How it failed.
    pub kind: CleanupFailureKind,
}

/// Outcome of the cleanup phase of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Steps whose cleanup completed, in execution order.
    pub cleaned: Vec<String>,
    /// Steps whose cleanup failed, in execution order.
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    /// Returns true if every cleanup completed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Records the outcome of one cleanup.
    pub fn record(&mut self, step: &str, outcome: Result<(), CleanupFailure>) {
        match outcome {
            Ok(()) => self.cleaned.push(step.to_string()),
            Err(failure) => self.failures.push(failure),
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("cleaned".to_string(), serde_json::json!(self.cleaned));
        map.insert(
            "failures".to_string(),
            serde_json::to_value(&self.failures).unwrap_or_default(),
        );
        map
    }
}

/// Runs one cleanup future with a time budget, catching panics.
///
/// The failure is logged here; callers only need to record it.
///
/// # Errors
///
/// Returns a `CleanupFailure` if the cleanup errored, panicked or timed out.
pub async fn guarded_cleanup<F>(
    step: &str,
    timeout: Duration,
    cleanup: F,
) -> Result<(), CleanupFailure>
where
    F: Future<Output = Result<(), BuildError>>,
{
    let result = tokio::time::timeout(timeout, AssertUnwindSafe(cleanup).catch_unwind()).await;

    let failure = match result {
        Ok(Ok(Ok(()))) => return Ok(()),
        Ok(Ok(Err(err))) => CleanupFailure {
            step: step.to_string(),
            message: err.to_string(),
            kind: CleanupFailureKind::Errored,
        },
        Ok(Err(panic)) => CleanupFailure {
            step: step.to_string(),
            message: format!("cleanup panicked: {}", panic_message(panic.as_ref())),
            kind: CleanupFailureKind::Panicked,
        },
        Err(_) => CleanupFailure {
            step: step.to_string(),
            message: format!("cleanup timed out after {}ms", timeout.as_millis()),
            kind: CleanupFailureKind::TimedOut,
        },
    };

    warn!(step, kind = ?failure.kind, "{}", failure.message);
    Err(failure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guarded_cleanup_ok() {
        let result = guarded_cleanup("key_pair", Duration::from_secs(1), async { Ok(()) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_guarded_cleanup_error() {
        let failure = guarded_cleanup("key_pair", Duration::from_secs(1), async {
            Err(BuildError::Internal("delete refused".into()))
        })
        .await
        .unwrap_err();

        assert_eq!(failure.step, "key_pair");
        assert_eq!(failure.kind, CleanupFailureKind::Errored);
        assert!(failure.message.contains("delete refused"));
    }

    #[tokio::test]
    async fn test_guarded_cleanup_panic() {
        let failure = guarded_cleanup("instance", Duration::from_secs(1), async {
            let explode = true;
            if explode {
                panic!("teardown exploded");
            }
            Ok(())
        })
        .await
        .unwrap_err();

        assert_eq!(failure.kind, CleanupFailureKind::Panicked);
        assert!(failure.message.contains("teardown exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_cleanup_timeout() {
        let failure = guarded_cleanup("instance", Duration::from_millis(100), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await
        .unwrap_err();

        assert_eq!(failure.kind, CleanupFailureKind::TimedOut);
    }

    #[test]
    fn test_report_record() {
        let mut report = CleanupReport::default();
        report.record("a", Ok(()));
        report.record(
            "b",
            Err(CleanupFailure {
                step: "b".into(),
                message: "nope".into(),
                kind: CleanupFailureKind::Errored,
            }),
        );

        assert_eq!(report.cleaned, vec!["a"]);
        assert_eq!(report.failures.len(), 1);
        assert!(!report.is_clean());
        assert!(report.to_dict().contains_key("failures"));
    }
}
