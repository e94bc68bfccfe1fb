//! Error types for the imageforge build engine.
//!
//! Forward-progress failures travel as [`BuildError`]; the narrower types
//! (state, configuration, pipeline validation) convert into it with `?`.
//! Retry decisions are made on [`ErrorClass`] through the [`Classify`]
//! trait rather than by inspecting error strings.

use crate::provider::ProviderError;
use crate::replication::ReplicationError;
use crate::waiter::WaitError;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use thiserror::Error;

/// Coarse classification of a failure, used by retry predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The provider asked us to slow down.
    Throttled,
    /// The resource is not visible yet (or any more).
    NotFound,
    /// A transient service-side failure.
    Transient,
    /// The resource is still referenced by another resource.
    DependencyViolation,
    /// Anything that will not get better by trying again.
    Fatal,
}

impl ErrorClass {
    /// Returns true for classes the default retry policy retries.
    ///
    /// `DependencyViolation` is deliberately absent: only teardown paths
    /// that expect a dependent resource to drain opt into retrying it.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Throttled | Self::NotFound | Self::Transient)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Throttled => write!(f, "throttled"),
            Self::NotFound => write!(f, "not_found"),
            Self::Transient => write!(f, "transient"),
            Self::DependencyViolation => write!(f, "dependency_violation"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Typed error classification.
pub trait Classify {
    /// Returns the class of this error.
    fn class(&self) -> ErrorClass;

    /// Returns true if the default policy should retry this error.
    fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

/// The main error type for build operations.
#[derive(Debug, Clone, Error)]
pub enum BuildError {
    /// A step could not make progress.
    #[error("step '{step}' failed: {source}")]
    Step {
        /// The step name.
        step: String,
        /// What went wrong.
        #[source]
        source: Box<BuildError>,
    },

    /// A step panicked; the panic was caught at the runner boundary.
    #[error("step '{step}' panicked: {message}")]
    StepPanicked {
        /// The step name.
        step: String,
        /// The panic payload, rendered.
        message: String,
    },

    /// The build was cancelled.
    #[error("build cancelled: {reason}")]
    Cancelled {
        /// The cancellation reason.
        reason: String,
    },

    /// A state bag read failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// A provider call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Some replication targets failed.
    #[error(transparent)]
    Replication(#[from] ReplicationError),

    /// Waiting for a resource failed.
    #[error(transparent)]
    Wait(#[from] WaitError),

    /// A retried operation kept failing.
    #[error("gave up after {attempts} attempt(s): {source}")]
    RetryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last error seen.
        #[source]
        source: Box<BuildError>,
    },

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Invalid pipeline definition.
    #[error(transparent)]
    Validation(#[from] PipelineValidationError),

    /// A step found the build in a state it cannot work with.
    #[error("{0}")]
    Precondition(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BuildError {
    /// Wraps an error with the name of the step that hit it.
    ///
    /// Cancellation is passed through unwrapped so callers can still match
    /// on it directly.
    #[must_use]
    pub fn in_step(step: impl Into<String>, error: Self) -> Self {
        match error {
            Self::Cancelled { .. } | Self::Step { .. } | Self::StepPanicked { .. } => error,
            other => Self::Step {
                step: step.into(),
                source: Box::new(other),
            },
        }
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Creates a precondition error.
    #[must_use]
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// Returns true if this error (or what it wraps) is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled { .. } | Self::Wait(WaitError::Cancelled { .. }) => true,
            Self::Step { source, .. } | Self::RetryExhausted { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Returns a short machine-readable name for the variant.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Step { .. } => "step",
            Self::StepPanicked { .. } => "step_panicked",
            Self::Cancelled { .. } => "cancelled",
            Self::State(_) => "state",
            Self::Provider(_) => "provider",
            Self::Replication(_) => "replication",
            Self::Wait(_) => "wait",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Config(_) => "config",
            Self::Validation(_) => "validation",
            Self::Precondition(_) => "precondition",
            Self::Internal(_) => "internal",
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.kind()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map.insert("class".to_string(), serde_json::json!(self.class()));

        match self {
            Self::Step { step, .. } | Self::StepPanicked { step, .. } => {
                map.insert("step".to_string(), serde_json::json!(step));
            }
            Self::Replication(err) => {
                map.insert(
                    "failed_targets".to_string(),
                    serde_json::json!(err.targets()),
                );
            }
            Self::RetryExhausted { attempts, .. } => {
                map.insert("attempts".to_string(), serde_json::json!(attempts));
            }
            _ => {}
        }

        map
    }
}

impl Classify for BuildError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Provider(err) => err.class(),
            Self::Wait(err) => err.class(),
            Self::Step { source, .. } => source.class(),
            _ => ErrorClass::Fatal,
        }
    }
}

/// Error raised when reading the state bag.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// The key was never published.
    #[error("state key '{key}' is missing")]
    Missing {
        /// The key.
        key: String,
    },

    /// The key holds a value of another type.
    #[error("state key '{key}' holds {found}, expected {expected}")]
    TypeMismatch {
        /// The key.
        key: String,
        /// Requested type name.
        expected: &'static str,
        /// Stored type name.
        found: &'static str,
    },
}

impl StateError {
    /// Creates a missing-key error.
    #[must_use]
    pub fn missing(key: impl Into<String>) -> Self {
        Self::Missing { key: key.into() }
    }

    /// Returns the key involved.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Missing { key } | Self::TypeMismatch { key, .. } => key,
        }
    }
}

/// Error raised when a configuration is invalid or unreadable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A field failed validation.
    #[error("invalid configuration field '{field}': {message}")]
    Invalid {
        /// The field name.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// The document could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// The file could not be read.
    #[error("failed to read configuration from {path}: {message}")]
    Io {
        /// The path that was read.
        path: String,
        /// The underlying error.
        message: String,
    },
}

impl ConfigError {
    /// Creates a field validation error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Error raised when a pipeline definition is rejected.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// Error code (e.g., "PIPELINE-EMPTY").
    pub code: &'static str,
    /// The steps involved in the error.
    pub steps: Vec<String>,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            steps: Vec::new(),
            fix_hint: None,
        }
    }

    /// Sets the steps involved.
    #[must_use]
    pub fn with_steps(mut self, steps: Vec<String>) -> Self {
        self.steps = steps;
        self
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::json!(self.code));
        map.insert("message".to_string(), serde_json::json!(self.message));
        map.insert("steps".to_string(), serde_json::json!(self.steps));
        if let Some(ref hint) = self.fix_hint {
            map.insert("fix_hint".to_string(), serde_json::json!(hint));
        }
        map
    }
}

/// Renders a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
