//! What a pipeline run produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::cancellation::CleanupReport;
use crate::errors::BuildError;
use crate::state::StateBag;

/// Lifecycle of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Not started yet.
    NotStarted,
    /// Steps are executing.
    Running,
    /// Every step continued.
    Completed,
    /// A step halted or panicked.
    Halted,
    /// The build was cancelled.
    Cancelled,
}

impl RunState {
    /// Returns true for states a run ends in.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Halted | Self::Cancelled)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Halted => write!(f, "halted"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// How a single step's `run` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Returned `Continue`.
    Continued,
    /// Returned `Halt`.
    Halted,
    /// Panicked.
    Panicked,
    /// Still running when the cancellation grace period ran out.
    Abandoned,
}

/// Timing and outcome of one started step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// The step name.
    pub name: String,
    /// How `run` ended.
    pub outcome: StepOutcome,
    /// Wall time spent in `run`.
    pub duration_ms: u64,
}

/// The result of [`Runner::run`](super::Runner::run).
#[derive(Debug)]
pub struct PipelineReport {
    /// The pipeline name.
    pub pipeline: String,
    /// Terminal state of the run.
    pub state: RunState,
    /// The halting error, or the cancellation.
    pub error: Option<BuildError>,
    /// Why the build was cancelled, if it was.
    pub cancel_reason: Option<String>,
    /// Every step that started, in execution order.
    pub steps: Vec<StepRecord>,
    /// Cleanup outcomes, in cleanup order.
    pub cleanup: CleanupReport,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When cleanup finished.
    pub ended_at: DateTime<Utc>,
    /// The state bag as the last cleanup left it.
    pub state_bag: StateBag,
}

impl PipelineReport {
    /// Returns true if every step continued.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.state == RunState::Completed
    }

    /// Returns the names of the steps that started.
    #[must_use]
    pub fn started_steps(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    /// Returns the total run time in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }

    /// Returns the state bag on success, the first halting error otherwise.
    ///
    /// # Errors
    ///
    /// Returns the recorded error when the run did not complete.
    pub fn into_result(self) -> Result<StateBag, BuildError> {
        match self.state {
            RunState::Completed => Ok(self.state_bag),
            state => Err(self
                .error
                .unwrap_or_else(|| BuildError::Internal(format!("run ended in state {state}")))),
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("pipeline".to_string(), serde_json::json!(self.pipeline));
        map.insert("state".to_string(), serde_json::json!(self.state));
        map.insert(
            "error".to_string(),
            self.error
                .as_ref()
                .map_or(serde_json::Value::Null, |e| serde_json::json!(e.to_dict())),
        );
        map.insert(
            "cancel_reason".to_string(),
            serde_json::json!(self.cancel_reason),
        );
        map.insert(
            "steps".to_string(),
            serde_json::to_value(&self.steps).unwrap_or_default(),
        );
        map.insert(
            "cleanup".to_string(),
            serde_json::json!(self.cleanup.to_dict()),
        );
        map.insert(
            "started_at".to_string(),
            serde_json::json!(self.started_at.to_rfc3339()),
        );
        map.insert(
            "ended_at".to_string(),
            serde_json::json!(self.ended_at.to_rfc3339()),
        );
        map.insert("duration_ms".to_string(), serde_json::json!(self.duration_ms()));
        map.insert("state_keys".to_string(), serde_json::json!(self.state_bag.keys()));
        map
    }

    /// Renders the report as a JSON document.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!(self.to_dict())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(state: RunState, error: Option<BuildError>) -> PipelineReport {
        let now = Utc::now();
        PipelineReport {
            pipeline: "image".into(),
            state,
            error,
            cancel_reason: None,
            steps: vec![StepRecord {
                name: "a".into(),
                outcome: StepOutcome::Continued,
                duration_ms: 3,
            }],
            cleanup: CleanupReport::default(),
            started_at: now,
            ended_at: now,
            state_bag: StateBag::new(),
        }
    }

    #[test]
    fn test_into_result() {
        assert!(report(RunState::Completed, None).into_result().is_ok());

        let err = report(RunState::Halted, Some(BuildError::precondition("nope")))
            .into_result()
            .unwrap_err();
        assert_eq!(err.to_string(), "nope");

        let err = report(RunState::Halted, None).into_result().unwrap_err();
        assert!(matches!(err, BuildError::Internal(_)));
    }

    #[test]
    fn test_to_json() {
        let json = report(RunState::Completed, None).to_json();
        assert_eq!(json["state"], "completed");
        assert_eq!(json["steps"][0]["outcome"], "continued");
        assert!(json["error"].is_null());
    }

    #[test]
    fn test_run_state_terminal() {
        assert!(RunState::Cancelled.is_terminal());
        assert!(!RunState::Running.is_terminal());
    }
}
