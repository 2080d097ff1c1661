//! Error types for Threadline.

use thiserror::Error;

/// Broad classification of a [`ThreadlineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    /// Disk, database or serialization failure in the persistence layer.
    Persistence,
    /// Stored data that could be read but not reconstructed.
    Reconstruction,
    /// The backend connection dropped or misbehaved.
    Backend,
    /// Caller supplied something the engine cannot accept.
    Usage,
    /// Invalid or missing configuration.
    Configuration,
    /// The operation was cancelled or timed out.
    Interrupted,
    /// The injected step function reported a failure.
    Step,
}

/// Primary error type for all Threadline operations.
#[derive(Error, Debug)]
pub enum ThreadlineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid thread id: {0}")]
    InvalidThreadId(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Operation canceled")]
    Canceled,

    #[error("Step failed: {0}")]
    StepFailed(String),
}

impl ThreadlineError {
    /// Shorthand for a backend (connection-level) failure.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// Shorthand for a step-function failure.
    pub fn step(message: impl Into<String>) -> Self {
        Self::StepFailed(message.into())
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Io(_) => ErrorCategory::Persistence,
            #[cfg(feature = "sqlite")]
            Self::Database(_) => ErrorCategory::Persistence,
            Self::Serialization(_) | Self::UnknownMessageType(_) => ErrorCategory::Reconstruction,
            Self::InvalidThreadId(_) | Self::InvalidArgument(_) | Self::InvalidState(_) => {
                ErrorCategory::Usage
            }
            Self::Backend(_) => ErrorCategory::Backend,
            Self::Timeout(_) | Self::Canceled => ErrorCategory::Interrupted,
            Self::StepFailed(_) => ErrorCategory::Step,
        }
    }

    /// Whether a fresh attempt (reconnect, new `send`) may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Backend | ErrorCategory::Interrupted
        )
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ThreadlineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_are_transient() {
        assert!(ThreadlineError::backend("pipe closed").is_transient());
        assert!(ThreadlineError::Timeout(500).is_transient());
        assert!(!ThreadlineError::InvalidArgument("x".into()).is_transient());
    }

    #[test]
    fn categories_cover_persistence_and_reconstruction() {
        let io = ThreadlineError::from(std::io::Error::other("disk gone"));
        assert_eq!(io.category(), ErrorCategory::Persistence);
        let unknown = ThreadlineError::UnknownMessageType("hologram".into());
        assert_eq!(unknown.category(), ErrorCategory::Reconstruction);
        assert_eq!(unknown.category().to_string(), "reconstruction");
    }

    #[test]
    fn display_includes_detail() {
        let err = ThreadlineError::StepFailed("model refused".into());
        assert_eq!(err.to_string(), "Step failed: model refused");
    }
}
