//! Error types for flatload

use thiserror::Error;

/// Result type alias for flatload operations
pub type Result<T> = std::result::Result<T, FlatloadError>;

/// Infrastructure-level error shared across the workspace
#[derive(Error, Debug)]
pub enum FlatloadError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl FlatloadError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
