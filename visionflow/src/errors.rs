//! Error taxonomy for the visionflow pipeline.
//!
//! Every failure that can cross a component boundary is represented here.
//! Callers never see raw transport errors; providers and executors translate
//! them into this taxonomy at the seam.

use crate::core::Stage;
use thiserror::Error;

/// The main error type for visionflow operations.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// A transient failure (network, timeout). Eligible for retry.
    #[error("transient failure in '{operation}': {message}")]
    Transient {
        /// The operation that failed.
        operation: String,
        /// Description of the failure.
        message: String,
    },

    /// Malformed input or output. Never retried; surfaced immediately.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The circuit breaker for an operation is open. Fails fast and is not
    /// counted as a new breaker failure.
    #[error("circuit open for operation '{operation}'")]
    CircuitOpen {
        /// The guarded operation name.
        operation: String,
    },

    /// A resume token exists but its TTL has elapsed.
    #[error("resume token expired: {token}")]
    TokenExpired {
        /// The expired token.
        token: String,
    },

    /// A resume token was never issued or has been pruned.
    #[error("resume token not found: {token}")]
    TokenNotFound {
        /// The unknown token.
        token: String,
    },

    /// A stage exhausted its retry budget or hit a non-retryable error.
    /// Terminal for the run.
    #[error("stage '{stage}' failed: {cause}")]
    StageFailure {
        /// The stage that failed.
        stage: Stage,
        /// The underlying cause, after retry exhaustion.
        cause: String,
    },

    /// A dependency-loader node was skipped because an ancestor failed.
    #[error("node '{node}' blocked by failed ancestor '{ancestor}'")]
    DependencyBlocked {
        /// The skipped node id.
        node: String,
        /// The failed ancestor id.
        ancestor: String,
    },

    /// The run was cancelled cooperatively.
    #[error("run cancelled: {reason}")]
    Cancelled {
        /// The cancellation reason.
        reason: String,
    },

    /// No run exists under the given id.
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// A generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Creates a transient error for an operation.
    #[must_use]
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Creates a stage failure wrapping an underlying cause.
    #[must_use]
    pub fn stage_failure(stage: Stage, cause: impl Into<String>) -> Self {
        Self::StageFailure {
            stage,
            cause: cause.into(),
        }
    }

    /// Returns true if the error is eligible for retry.
    ///
    /// Only transient failures qualify. Validation errors and fast-failing
    /// open breakers are never retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns true if the error represents cooperative cancellation.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_is_retryable() {
        let err = PipelineError::transient("vision_analysis", "connection reset");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_validation_not_retryable() {
        assert!(!PipelineError::validation("bad payload").is_retryable());
    }

    #[test]
    fn test_circuit_open_not_retryable() {
        let err = PipelineError::CircuitOpen {
            operation: "vision_analysis".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_cancelled_detection() {
        let err = PipelineError::cancelled("user request");
        assert!(err.is_cancellation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_stage_failure_display() {
        let err = PipelineError::stage_failure(Stage::Vision, "budget exhausted");
        assert!(err.to_string().contains("vision"));
        assert!(err.to_string().contains("budget exhausted"));
    }
}
