//! Error types for the reconciler crate.
//!
//! Artefact-level variants (`ParseFailed`, `ApplyFailed`, `ApplyTimeout`)
//! are captured as data on wrappers and reported through the callback;
//! only source and store failures abort a pass.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Source content could not be parsed into artefacts.
    #[error("failed to parse '{location}': {reason}")]
    ParseFailed { location: String, reason: String },

    /// A synchronizer rejected a phase attempt.
    #[error("{phase} of '{key}' failed: {reason}")]
    ApplyFailed {
        key: String,
        phase: String,
        reason: String,
    },

    /// A phase attempt exceeded its time budget.
    #[error("{phase} of '{key}' timed out after {}ms", .timeout.as_millis())]
    ApplyTimeout {
        key: String,
        phase: String,
        timeout: Duration,
    },

    /// The source repository could not be enumerated or read.
    #[error("source '{location}' unavailable: {reason}")]
    SourceUnavailable { location: String, reason: String },

    /// The artefact store rejected an operation.
    #[error("store operation '{operation}' failed: {reason}")]
    StoreFailed { operation: String, reason: String },

    /// A lifecycle change that the model forbids.
    #[error("invalid lifecycle transition for '{key}' from {from} to {to}")]
    InvalidTransition { key: String, from: String, to: String },

    /// A processor or loop was assembled incorrectly.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The scheduled loop gave up.
    #[error("synchronization loop stopped: {reason}")]
    LoopStopped { reason: String },
}

impl Error {
    /// Create a parse error.
    pub fn parse_failed(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ParseFailed {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Create an apply error.
    pub fn apply_failed(
        key: impl Into<String>,
        phase: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self::ApplyFailed {
            key: key.into(),
            phase: phase.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an apply timeout error.
    pub fn apply_timeout(key: impl Into<String>, phase: impl ToString, timeout: Duration) -> Self {
        Self::ApplyTimeout {
            key: key.into(),
            phase: phase.to_string(),
            timeout,
        }
    }

    /// Create a source error.
    pub fn source_unavailable(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Create a store error.
    pub fn store_failed(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StoreFailed {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid transition error.
    pub fn invalid_transition(key: impl Into<String>, from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            key: key.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a loop stopped error.
    pub fn loop_stopped(reason: impl Into<String>) -> Self {
        Self::LoopStopped {
            reason: reason.into(),
        }
    }

    /// Whether this error must abort the whole pass.
    pub fn is_pass_fatal(&self) -> bool {
        matches!(self, Self::SourceUnavailable { .. } | Self::StoreFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_failed_display() {
        let err = Error::apply_failed("role:/a.role:a", "CREATE", "duplicate name");
        let text = err.to_string();
        assert!(text.contains("CREATE"));
        assert!(text.contains("role:/a.role:a"));
        assert!(text.contains("duplicate name"));
    }

    #[test]
    fn test_timeout_display_uses_millis() {
        let err = Error::apply_timeout("k", "UPDATE", Duration::from_millis(250));
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_pass_fatal_classification() {
        assert!(Error::source_unavailable("/", "io").is_pass_fatal());
        assert!(Error::store_failed("save", "locked").is_pass_fatal());
        assert!(!Error::parse_failed("/x.role", "bad json").is_pass_fatal());
        assert!(!Error::apply_failed("k", "CREATE", "no").is_pass_fatal());
    }
}
