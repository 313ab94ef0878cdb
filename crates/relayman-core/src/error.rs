//! Error types for Relayman core

use relayman_types::{AuthMethod, TaskStatus};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in Relayman core
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Rate limited by transport for {seconds}s")]
    Throttled { seconds: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    #[error("No live connection for {0}")]
    ConnectionUnavailable(AuthMethod),

    #[error("Task already running: {0}")]
    AlreadyRunning(Uuid),

    #[error("Engine claim of task {0} was taken over")]
    ClaimLost(Uuid),

    #[error("Cannot move task from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl RelayError {
    /// Check if a single send failing with this error is worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::Throttled { .. } | RelayError::Transport(_) | RelayError::Network(_)
        )
    }
}

/// Failure of a single transport call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The platform asked us to slow down for `seconds`
    #[error("flood wait of {seconds}s")]
    Throttle { seconds: u64 },

    #[error("{0}")]
    Failed(String),
}

impl From<TransportError> for RelayError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Throttle { seconds } => RelayError::Throttled { seconds },
            TransportError::Failed(cause) => RelayError::Transport(cause),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        TransportError::Failed(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_converts_to_throttled() {
        let err: RelayError = TransportError::Throttle { seconds: 12 }.into();
        assert!(matches!(err, RelayError::Throttled { seconds: 12 }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_lifecycle_errors_are_not_retryable() {
        assert!(!RelayError::NotFound(Uuid::nil()).is_retryable());
        assert!(!RelayError::InvalidTransition {
            from: TaskStatus::Completed,
            to: TaskStatus::Running,
        }
        .is_retryable());
    }
}
