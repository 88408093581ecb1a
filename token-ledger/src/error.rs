//! Error types for the token ledger

use crate::types::AccountId;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Debit would drive the balance negative
    #[error("Insufficient balance on {account_id}: balance {balance}, requested {requested}")]
    InsufficientBalance {
        /// Account that would have gone negative
        account_id: AccountId,
        /// Balance at the time of the attempt
        balance: u64,
        /// Amount the debit asked for
        requested: u64,
    },

    /// One leg of a transfer is missing or the legs do not balance
    #[error("Transfer integrity error: {0}")]
    TransferIntegrity(String),

    /// Lock-wait timeout or store unavailability; safe to retry
    #[error("Transient store error: {0}")]
    TransientStore(String),

    /// Request rejected before touching the store
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invariant violation (negative balance, broken balance chain, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON payload error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the failure may succeed if retried unchanged
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientStore(_) | Error::Concurrency(_))
    }

    /// Whether this is an expected rejection rather than a fault
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Error::InsufficientBalance { .. } | Error::InvalidRequest(_)
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        match err.kind() {
            rocksdb::ErrorKind::Busy
            | rocksdb::ErrorKind::TimedOut
            | rocksdb::ErrorKind::TryAgain => Error::TransientStore(err.to_string()),
            _ => Error::Storage(err.to_string()),
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::TransientStore("lock wait".into()).is_transient());
        assert!(!Error::InvalidRequest("bad".into()).is_transient());
        assert!(!Error::Storage("disk".into()).is_transient());
    }

    #[test]
    fn test_expected_outcomes() {
        let err = Error::InsufficientBalance {
            account_id: AccountId::new("acct-a"),
            balance: 5,
            requested: 20,
        };
        assert!(err.is_expected());
        assert!(Error::InvalidRequest("zero amount".into()).is_expected());
        assert!(err.to_string().contains("acct-a"));
        assert!(!Error::Storage("disk".into()).is_expected());
    }
}
