//! Aggregated outcome of a fan-out.

use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::errors::BuildError;

/// One failed replication target.
#[derive(Debug, Clone)]
pub struct TargetFailure {
    /// The target id.
    pub target: String,
    /// Why it failed.
    pub error: BuildError,
}

/// Every failure of one fan-out, ordered by target.
#[derive(Debug, Clone, Error)]
#[error(
    "replication failed for {} of {attempted} targets: {}",
    .failures.len(),
    render(.failures)
)]
pub struct ReplicationError {
    /// Failed targets and their causes.
    pub failures: Vec<TargetFailure>,
    /// Number of targets attempted.
    pub attempted: usize,
}

impl ReplicationError {
    /// Returns the failed target ids.
    #[must_use]
    pub fn targets(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.target.as_str()).collect()
    }
}

fn render(failures: &[TargetFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{}: {}", failure.target, failure.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Per-target results of [`Replicator::run_all`](super::Replicator::run_all).
///
/// Successes are kept even when some targets failed.
#[derive(Debug)]
pub struct ReplicationResult<T> {
    /// Successful targets and their values.
    pub succeeded: BTreeMap<String, T>,
    /// Failed targets and their errors.
    pub failed: BTreeMap<String, BuildError>,
}

impl<T> Default for ReplicationResult<T> {
    fn default() -> Self {
        Self {
            succeeded: BTreeMap::new(),
            failed: BTreeMap::new(),
        }
    }
}

impl<T> ReplicationResult<T> {
    /// Returns true if every target succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Returns the number of targets attempted.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// Returns the aggregate error, if any target failed.
    #[must_use]
    pub fn error(&self) -> Option<ReplicationError> {
        if self.failed.is_empty() {
            return None;
        }
        Some(ReplicationError {
            failures: self
                .failed
                .iter()
                .map(|(target, error)| TargetFailure {
                    target: target.clone(),
                    error: error.clone(),
                })
                .collect(),
            attempted: self.attempted(),
        })
    }

    /// Splits into successes and the aggregate error.
    #[must_use]
    pub fn into_parts(self) -> (BTreeMap<String, T>, Option<ReplicationError>) {
        let error = self.error();
        (self.succeeded, error)
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert(
            "succeeded".to_string(),
            serde_json::json!(self.succeeded.keys().collect::<Vec<_>>()),
        );
        let failed: BTreeMap<&String, String> = self
            .failed
            .iter()
            .map(|(target, error)| (target, error.to_string()))
            .collect();
        map.insert("failed".to_string(), serde_json::json!(failed));
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_lists_every_failure() {
        let mut result: ReplicationResult<u32> = ReplicationResult::default();
        result.succeeded.insert("us".into(), 1);
        result
            .failed
            .insert("eu".into(), BuildError::Internal("copy refused".into()));
        result
            .failed
            .insert("ap".into(), BuildError::cancelled("interrupt"));

        assert!(!result.is_success());
        let err = result.error().unwrap();
        assert_eq!(err.targets(), vec!["ap", "eu"]);
        assert_eq!(err.attempted, 3);

        let rendered = err.to_string();
        assert!(rendered.starts_with("replication failed for 2 of 3 targets"));
        assert!(rendered.contains("eu: Internal error: copy refused"));
    }

    #[test]
    fn test_error_message_joins_failures_in_target_order() {
        let err = ReplicationError {
            failures: vec![
                TargetFailure {
                    target: "ap-south-1".into(),
                    error: BuildError::precondition("region disabled"),
                },
                TargetFailure {
                    target: "eu-west-1".into(),
                    error: BuildError::precondition("quota exceeded"),
                },
            ],
            attempted: 3,
        };

        assert_eq!(
            err.to_string(),
            "replication failed for 2 of 3 targets: ap-south-1: region disabled; eu-west-1: quota exceeded"
        );
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn test_success_has_no_error() {
        let mut result: ReplicationResult<()> = ReplicationResult::default();
        result.succeeded.insert("us".into(), ());
        assert!(result.is_success());

        let (succeeded, error) = result.into_parts();
        assert_eq!(succeeded.len(), 1);
        assert!(error.is_none());
    }
}
