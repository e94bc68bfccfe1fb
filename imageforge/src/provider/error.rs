//! Classified provider errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::{Classify, ErrorClass};

/// An error returned by an [`ImageProvider`](super::ImageProvider) call.
///
/// The provider adapter maps its own error codes onto an [`ErrorClass`]
/// so retry decisions never parse messages.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ProviderError {
    /// Classification used by retry predicates.
    pub class: ErrorClass,
    /// Provider error code, e.g. `InvalidAMIID.NotFound`.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ProviderError {
    /// Creates a new provider error.
    #[must_use]
    pub fn new(class: ErrorClass, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class,
            code: code.into(),
            message: message.into(),
        }
    }

    /// A resource that is not (yet) visible.
    #[must_use]
    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::NotFound, code, message)
    }

    /// Request throttling.
    #[must_use]
    pub fn throttled(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Throttled, "RequestLimitExceeded", message)
    }

    /// A transient service failure.
    #[must_use]
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, code, message)
    }

    /// The resource is still in use by another resource.
    #[must_use]
    pub fn dependency_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::DependencyViolation, "DependencyViolation", message)
    }

    /// A failure that will not go away on retry.
    #[must_use]
    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Fatal, code, message)
    }

    /// Returns true if the error means the resource does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.class == ErrorClass::NotFound
    }
}

impl Classify for ProviderError {
    fn class(&self) -> ErrorClass {
        self.class
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = ProviderError::not_found("InvalidGroup.NotFound", "sg-1 does not exist");
        assert_eq!(err.to_string(), "InvalidGroup.NotFound: sg-1 does not exist");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_classification() {
        assert!(ProviderError::throttled("slow").is_retryable());
        assert!(ProviderError::transient("InternalError", "oops").is_retryable());
        assert!(!ProviderError::dependency_violation("in use").is_retryable());
        assert!(!ProviderError::fatal("AuthFailure", "denied").is_retryable());
    }
}
