//! Error types for grove-core

use thiserror::Error;

/// Result type alias using grove-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in grove-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Entity, peer, or conflict not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Rejected input (peer registration, local mutation, incoming record)
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// Invalid configuration file or environment override
    #[error("Configuration error: {0}")]
    Config(String),

    /// Device identity or key material could not be created or loaded
    #[error("Identity error: {0}")]
    Identity(String),

    /// Peer presented a certificate that does not match the pinned fingerprint
    #[error(
        "Trust violation for peer {peer_id}: expected certificate {expected}, got {presented}"
    )]
    TrustViolation {
        peer_id: String,
        expected: String,
        presented: String,
    },

    /// Connection refused, timed out, or failed mid-request
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or version-incompatible payload
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Responder declined the session
    #[error("Sync refused: {0}")]
    Refused(String),

    /// Conflict already reached a terminal status
    #[error("Conflict {0} is already resolved")]
    ConflictResolved(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether the caller may retry the failed operation unchanged.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
