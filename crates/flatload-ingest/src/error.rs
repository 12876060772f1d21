//! Ingestion error types
//!
//! Attempt-scoped errors abort the current file only: they are written
//! verbatim to the control record and route the file to the error area.
//! Everything else is infrastructure failure that the caller decides on.

use thiserror::Error;
use uuid::Uuid;

use crate::ledger::AttemptStatus;

/// Result type alias for ingestion operations
pub type IngestResult<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    // ------------------------------------------------------------------
    // Attempt-scoped failures
    // ------------------------------------------------------------------
    #[error("Schema mismatch: file has {found} columns, mapping requires at least {expected}")]
    SchemaMismatch { expected: usize, found: usize },

    #[error("Required field '{column}' is empty in row {row}")]
    RequiredFieldMissing { row: usize, column: String },

    #[error("Cannot convert '{value}' to {data_type} for column '{column}' in row {row}")]
    TypeConversion {
        row: usize,
        column: String,
        value: String,
        data_type: String,
    },

    #[error("Data validation failed: {}", .0.join("; "))]
    ValidationFailed(Vec<String>),

    #[error("Missing required column '{column}' in record {row} (not nullable, no default value)")]
    MissingRequiredColumn { row: usize, column: String },

    #[error("Error loading batch {batch}: {reason}")]
    ChunkLoadFailed { batch: i32, reason: String },

    #[error("Failed to move '{from}' to '{to}': {reason}")]
    RelocationFailed {
        from: String,
        to: String,
        reason: String,
    },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Unsupported file type: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to read '{path}': {reason}")]
    Read { path: String, reason: String },

    #[error("Table '{0}' not found or has no columns")]
    TableNotFound(String),

    // ------------------------------------------------------------------
    // Ledger bookkeeping
    // ------------------------------------------------------------------
    #[error("Attempt {attempt_id} cannot move from {from} to {to}")]
    InvalidTransition {
        attempt_id: Uuid,
        from: AttemptStatus,
        to: AttemptStatus,
    },

    #[error("Checkpoint rejected for attempt {attempt_id}: {reason}")]
    CheckpointRejected { attempt_id: Uuid, reason: String },

    #[error("Attempt not found: {0}")]
    AttemptNotFound(Uuid),

    // ------------------------------------------------------------------
    // Infrastructure
    // ------------------------------------------------------------------
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Common(#[from] flatload_common::FlatloadError),
}

impl IngestError {
    /// Whether this error belongs to a single file's attempt
    ///
    /// Attempt-scoped errors close the attempt as ERROR and the run moves on
    /// to the next file.
    pub fn is_attempt_scoped(&self) -> bool {
        matches!(
            self,
            IngestError::SchemaMismatch { .. }
                | IngestError::RequiredFieldMissing { .. }
                | IngestError::TypeConversion { .. }
                | IngestError::ValidationFailed(_)
                | IngestError::MissingRequiredColumn { .. }
                | IngestError::ChunkLoadFailed { .. }
                | IngestError::RelocationFailed { .. }
                | IngestError::FileNotFound(_)
                | IngestError::UnsupportedFormat(_)
                | IngestError::Read { .. }
                | IngestError::TableNotFound(_)
                | IngestError::CheckpointRejected { .. }
        )
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
