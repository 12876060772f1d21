//! Control ledger
//!
//! One durable record per ingestion attempt of one file. The record moves
//! through a small state machine and is never deleted; it is both the audit
//! trail and the only input the retry pass reads.
//!
//! ```text
//! INITIATED -> IN_PROGRESS -> SUCCESS
//!                          -> ERROR -> PENDING_RETRY
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};

/// Attempt status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Initiated,
    InProgress,
    Success,
    Error,
    PendingRetry,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Initiated => "INITIATED",
            AttemptStatus::InProgress => "IN_PROGRESS",
            AttemptStatus::Success => "SUCCESS",
            AttemptStatus::Error => "ERROR",
            AttemptStatus::PendingRetry => "PENDING_RETRY",
        }
    }

    /// The only edges the ledger accepts
    pub fn can_transition_to(self, next: AttemptStatus) -> bool {
        use AttemptStatus::*;
        matches!(
            (self, next),
            (Initiated, InProgress)
                | (InProgress, Success)
                | (InProgress, Error)
                | (Error, PendingRetry)
        )
    }

    /// Unfinished statuses; a record left in one of these belongs to a live
    /// or crashed attempt
    pub fn is_open(self) -> bool {
        matches!(self, AttemptStatus::Initiated | AttemptStatus::InProgress)
    }

    /// Check an edge, naming the attempt on failure
    pub fn ensure_transition(self, attempt_id: Uuid, next: AttemptStatus) -> IngestResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(IngestError::InvalidTransition {
                attempt_id,
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "INITIATED" => Ok(AttemptStatus::Initiated),
            "IN_PROGRESS" => Ok(AttemptStatus::InProgress),
            "SUCCESS" => Ok(AttemptStatus::Success),
            "ERROR" => Ok(AttemptStatus::Error),
            "PENDING_RETRY" => Ok(AttemptStatus::PendingRetry),
            other => Err(IngestError::storage(format!("unknown attempt status '{}'", other))),
        }
    }
}

/// Where the file physically is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileLocation {
    Input,
    Archive,
    Error,
}

impl FileLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileLocation::Input => "INPUT",
            FileLocation::Archive => "ARCHIVE",
            FileLocation::Error => "ERROR",
        }
    }
}

impl fmt::Display for FileLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileLocation {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "INPUT" => Ok(FileLocation::Input),
            "ARCHIVE" => Ok(FileLocation::Archive),
            "ERROR" => Ok(FileLocation::Error),
            other => Err(IngestError::storage(format!("unknown file location '{}'", other))),
        }
    }
}

/// Progress of an attempt: whole chunks committed and rows inside them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub current_batch: i32,
    pub loaded_rows: i64,
}

impl Checkpoint {
    pub fn new(current_batch: i32, loaded_rows: i64) -> Self {
        Self {
            current_batch,
            loaded_rows,
        }
    }

    /// Checkpoint after committing one more chunk of `rows`
    pub fn next(self, rows: usize) -> Self {
        Self {
            current_batch: self.current_batch + 1,
            loaded_rows: self.loaded_rows + rows as i64,
        }
    }
}

/// One ingestion attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRecord {
    pub attempt_id: Uuid,
    pub file_name: String,
    pub file_path: String,
    pub target_table: String,
    pub status: AttemptStatus,
    pub total_rows: Option<i64>,
    pub loaded_rows: Option<i64>,
    pub current_batch: Option<i32>,
    pub error_message: Option<String>,
    pub file_location: FileLocation,
    /// Current physical path of the file
    pub located_path: String,
    /// Attempt that resumed from this one
    pub superseded_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub created_by: String,
    pub modified_by: String,
}

impl ControlRecord {
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(
            self.current_batch.unwrap_or(0),
            self.loaded_rows.unwrap_or(0),
        )
    }

    /// Whether a new attempt on the file at `path` may continue from this
    /// record's checkpoint
    ///
    /// Only a closed attempt whose file is still that exact input file
    /// qualifies; a file with a reused name elsewhere is a different file.
    pub fn resumable_at(&self, path: &str) -> bool {
        matches!(self.status, AttemptStatus::Error | AttemptStatus::PendingRetry)
            && self.superseded_by.is_none()
            && self.file_location == FileLocation::Input
            && self.located_path == path
    }

    /// Check that `next` may follow this record's checkpoint
    pub fn accepts(&self, next: Checkpoint) -> Result<(), String> {
        if self.status != AttemptStatus::InProgress {
            return Err(format!("attempt is {}", self.status));
        }
        let current = self.checkpoint();
        if next.current_batch < current.current_batch {
            return Err(format!(
                "batch {} is behind committed batch {}",
                next.current_batch, current.current_batch
            ));
        }
        if let Some(total) = self.total_rows {
            if next.loaded_rows > total {
                return Err(format!(
                    "loaded rows {} exceed total rows {}",
                    next.loaded_rows, total
                ));
            }
        }
        Ok(())
    }
}

/// Arguments for opening an attempt
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub file_name: String,
    pub file_path: String,
    pub target_table: String,
    /// Progress carried over from a predecessor attempt
    pub resume: Checkpoint,
}

/// Filter for ledger inspection
#[derive(Debug, Clone, Default)]
pub struct LedgerFilter {
    pub status: Option<AttemptStatus>,
    pub file_name: Option<String>,
    pub limit: Option<i64>,
}

impl LedgerFilter {
    pub fn matches(&self, record: &ControlRecord) -> bool {
        self.status.is_none_or(|s| s == record.status)
            && self
                .file_name
                .as_deref()
                .is_none_or(|name| name == record.file_name)
    }
}

/// Durable attempt state machine
///
/// Every mutation is its own committed unit. Implementations reject edges
/// outside [`AttemptStatus::can_transition_to`] with `InvalidTransition`.
#[async_trait]
pub trait ControlLedger: Send + Sync {
    /// Create the record as INITIATED, then advance it to IN_PROGRESS
    async fn open(&self, attempt: &NewAttempt) -> IngestResult<Uuid>;

    /// INITIATED -> IN_PROGRESS
    async fn begin(&self, attempt_id: Uuid) -> IngestResult<()>;

    async fn set_total_rows(&self, attempt_id: Uuid, total_rows: i64) -> IngestResult<()>;

    /// Record a committed chunk outside a data transaction
    async fn advance(&self, attempt_id: Uuid, checkpoint: Checkpoint) -> IngestResult<()>;

    async fn close_success(
        &self,
        attempt_id: Uuid,
        total_loaded: i64,
        located_path: &str,
    ) -> IngestResult<()>;

    async fn close_error(
        &self,
        attempt_id: Uuid,
        message: &str,
        location: FileLocation,
        located_path: &str,
    ) -> IngestResult<()>;

    /// ERROR records nobody has resumed yet, oldest first
    async fn list_errors(&self) -> IngestResult<Vec<ControlRecord>>;

    async fn get(&self, attempt_id: Uuid) -> IngestResult<ControlRecord>;

    /// Newest first
    async fn list(&self, filter: &LedgerFilter) -> IngestResult<Vec<ControlRecord>>;

    /// Attempts for `file_name` that neither succeeded nor were resumed,
    /// newest first
    async fn list_unfinished(&self, file_name: &str) -> IngestResult<Vec<ControlRecord>>;

    /// Point a predecessor at the attempt that resumed it
    async fn supersede(&self, attempt_id: Uuid, successor: Uuid) -> IngestResult<()>;

    /// ERROR -> PENDING_RETRY, file back in the input area
    async fn mark_pending_retry(
        &self,
        attempt_id: Uuid,
        located_path: &str,
        reset_checkpoint: bool,
    ) -> IngestResult<()>;
}
