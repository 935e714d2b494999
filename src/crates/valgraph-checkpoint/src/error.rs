//! Error types for checkpoint storage and serialization.

use thiserror::Error;

/// Convenience result type using [`CheckpointError`]
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors raised by checkpoint stores and the state serializer
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Requested thread, namespace or checkpoint does not exist
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    /// Malformed configuration or arguments
    #[error("Invalid checkpoint operation: {0}")]
    Invalid(String),

    /// A state value could not be encoded as strict tagged JSON
    #[error("State value is not representable: {0}")]
    Unrepresentable(String),

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The underlying SQL store failed; fatal for the current execution
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// Encryption or decryption of a blob failed
    #[error("Blob encryption error: {0}")]
    Encryption(String),
}

impl CheckpointError {
    /// Stable wire kind carried in `error` events
    pub fn kind(&self) -> &'static str {
        match self {
            CheckpointError::NotFound(_) => "not_found",
            CheckpointError::Invalid(_) => "validation",
            CheckpointError::Unrepresentable(_) => "validation",
            CheckpointError::Serialization(_) => "persistence_failure",
            CheckpointError::Persistence(_) => "persistence_failure",
            CheckpointError::Encryption(_) => "persistence_failure",
        }
    }
}

impl From<sqlx::Error> for CheckpointError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CheckpointError::NotFound(err.to_string()),
            other => CheckpointError::Persistence(other.to_string()),
        }
    }
}
