//! Error types for the commit coordinator

use thiserror::Error;

/// Main error type for the coordinator
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Version conflict on transaction {tx_id}: expected version {expected}")]
    Conflict { tx_id: String, expected: u64 },

    #[error("Participant {participant} unavailable: {message}")]
    ParticipantUnavailable { participant: String, message: String },

    #[error("Participant {participant} did not acknowledge {operation} after {attempts} attempts")]
    ParticipantAckFailure {
        participant: String,
        operation: String,
        attempts: u32,
    },

    #[error("Protocol violation on transaction {tx_id}: {message}")]
    ProtocolViolation { tx_id: String, message: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Transaction {tx_id} not found")]
    NotFound { tx_id: String },

    #[error("Participant {participant} is not registered")]
    UnknownParticipant { participant: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Whether repeating the same call may succeed. Errors describing the
    /// request itself or the protocol never heal on their own.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CoordinatorError::Config(_)
                | CoordinatorError::Serialization(_)
                | CoordinatorError::InvalidArgument(_)
                | CoordinatorError::ProtocolViolation { .. }
                | CoordinatorError::NotFound { .. }
                | CoordinatorError::UnknownParticipant { .. }
                | CoordinatorError::InvalidStateTransition { .. }
        )
    }
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
