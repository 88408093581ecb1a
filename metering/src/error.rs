//! Error types for metering

use thiserror::Error;
use uuid::Uuid;

/// Result type for metering operations
pub type Result<T> = std::result::Result<T, Error>;

/// Metering errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] token_ledger::Error),

    /// Unknown session
    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    /// Lifecycle operation not allowed from the current state
    #[error("Invalid transition for session {session_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Session
        session_id: Uuid,
        /// Current state
        from: token_ledger::SessionState,
        /// Requested state
        to: token_ledger::SessionState,
    },

    /// Invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the underlying ledger failure is retryable
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Ledger(e) if e.is_transient())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
