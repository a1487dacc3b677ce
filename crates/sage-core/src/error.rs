//! Error types for sage-supervisor.

use thiserror::Error;

/// Result type alias using sage-supervisor's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for sage-supervisor operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Queue connection lost or never established
    #[error("Connection error: {0}")]
    Connection(String),

    /// Payload could not be decoded as a structured document
    #[error("Payload error: {0}")]
    Payload(String),

    /// A change subscriber failed while handling an event
    #[error("Subscriber '{subscriber}' failed: {message}")]
    Subscriber { subscriber: String, message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a subscriber failure from any displayable cause.
    pub fn subscriber(name: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Error::Subscriber {
            subscriber: name.into(),
            message: cause.to_string(),
        }
    }

    /// Whether the failure is tied to the connection rather than the data.
    ///
    /// Transient errors are recovered by the supervised loop reconnecting.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Connection(_) => true,
            Error::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
