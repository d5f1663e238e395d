//! Error types for the relay.
//!
//! Every operation that a client can trigger returns [`RelayError`]. The
//! connection task turns it into a `chat_error` frame for the initiating
//! connection only.

use thiserror::Error;

/// Failures reported by the storage facade.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt column {column}: {reason}")]
    Corrupt { column: &'static str, reason: String },

    #[error("storage lock poisoned")]
    Poisoned,
}

/// Errors surfaced to clients as `chat_error`.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("please register your user id first")]
    Unauthenticated,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage failure: {0}")]
    Persistence(#[from] StorageError),
}

impl RelayError {
    /// Reason string sent to the client.
    ///
    /// Storage details stay in the server log.
    pub fn client_reason(&self) -> String {
        match self {
            RelayError::Persistence(_) => "Internal error, please try again.".to_string(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
