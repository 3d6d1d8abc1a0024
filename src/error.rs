//! Error types for Mousy Core.
//!
//! This module defines the error types used throughout the library.
//! Remote adapter failures have their own type in [`crate::remote`] and are
//! wrapped by [`MousyError::Remote`].

use thiserror::Error;

use crate::remote::RemoteError;

/// Result type alias for Mousy operations
pub type MousyResult<T> = Result<T, MousyError>;

/// Main error type for Mousy operations
#[derive(Error, Debug)]
pub enum MousyError {
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database operation failed: {0}")]
    DatabaseOperation(String),

    #[error("Decode error in {key}: {message}")]
    Decode { key: String, message: String },

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Authentication required: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl MousyError {
    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        MousyError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new database operation error
    pub fn database_op(message: impl Into<String>) -> Self {
        MousyError::DatabaseOperation(message.into())
    }

    /// Create a new decode error for a storage key
    pub fn decode(key: impl Into<String>, message: impl Into<String>) -> Self {
        MousyError::Decode {
            key: key.into(),
            message: message.into(),
        }
    }

    /// True when the error came from local persistence rather than the network.
    pub fn is_local_storage(&self) -> bool {
        matches!(
            self,
            MousyError::Database(_)
                | MousyError::DatabaseOperation(_)
                | MousyError::Decode { .. }
                | MousyError::Json(_)
        )
    }
}
