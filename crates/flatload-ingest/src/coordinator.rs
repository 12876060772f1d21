//! Pipeline coordinator
//!
//! Drives every configured pattern through the pipeline:
//! 1. Discover: list input files whose name matches the pattern
//! 2. Claim: close stale attempts, pick up a predecessor's checkpoint
//! 3. Ingest: read, parse, validate against the live schema, load in chunks
//! 4. Route: archive on success, error area on failure, then close the record
//!
//! Files are processed strictly one after another. The ledger is only marked
//! terminal after the file has been relocated.

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::catalog::{FilePattern, SchemaCatalog};
use crate::error::{IngestError, IngestResult};
use crate::ledger::{
    AttemptStatus, Checkpoint, ControlLedger, ControlRecord, FileLocation, NewAttempt,
};
use crate::loader::{BatchLoader, DEFAULT_CHUNK_SIZE};
use crate::parser::SchemaMappedParser;
use crate::storage::{self, reader, FileStorage, StorageLayout};
use crate::store::RelationalStore;
use crate::validation::ValidationGate;

/// Message recorded on attempts a crashed process left open
pub const ABANDONED_MESSAGE: &str = "Attempt abandoned before completion";

/// Result of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FileOutcome {
    Loaded { attempt_id: Uuid, rows: i64 },
    Failed { attempt_id: Uuid, error: String },
}

impl FileOutcome {
    pub fn attempt_id(&self) -> Uuid {
        match self {
            FileOutcome::Loaded { attempt_id, .. } | FileOutcome::Failed { attempt_id, .. } => {
                *attempt_id
            },
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, FileOutcome::Loaded { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PatternSummary {
    pub pattern: String,
    pub discovered: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub patterns: Vec<PatternSummary>,
}

impl RunSummary {
    pub fn discovered(&self) -> usize {
        self.patterns.iter().map(|p| p.discovered).sum()
    }

    pub fn succeeded(&self) -> usize {
        self.patterns.iter().map(|p| p.succeeded).sum()
    }

    pub fn failed(&self) -> usize {
        self.patterns.iter().map(|p| p.failed).sum()
    }
}

/// Where a new attempt starts
struct Claim {
    predecessor: Option<ControlRecord>,
}

impl Claim {
    fn resume(&self) -> Checkpoint {
        self.predecessor
            .as_ref()
            .map(ControlRecord::checkpoint)
            .unwrap_or_default()
    }
}

pub struct PipelineCoordinator {
    catalog: SchemaCatalog,
    storage: Arc<dyn FileStorage>,
    layout: StorageLayout,
    store: Arc<dyn RelationalStore>,
    ledger: Arc<dyn ControlLedger>,
    chunk_size: usize,
}

impl PipelineCoordinator {
    pub fn new(
        catalog: SchemaCatalog,
        storage: Arc<dyn FileStorage>,
        layout: StorageLayout,
        store: Arc<dyn RelationalStore>,
        ledger: Arc<dyn ControlLedger>,
    ) -> Self {
        Self {
            catalog,
            storage,
            layout,
            store,
            ledger,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    /// Run every pattern in catalog order
    ///
    /// Attempt-scoped failures are recorded and the run moves on. Any other
    /// error stops the run after the current attempt has been closed.
    pub async fn run(&self) -> IngestResult<RunSummary> {
        let mut summary = RunSummary::default();
        for pattern in self.catalog.iter() {
            summary.patterns.push(self.run_pattern(pattern).await?);
        }

        info!(
            discovered = summary.discovered(),
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            "Run complete"
        );
        Ok(summary)
    }

    #[instrument(
        skip(self, pattern),
        fields(pattern = %pattern.name, table = %pattern.target_table)
    )]
    pub async fn run_pattern(&self, pattern: &FilePattern) -> IngestResult<PatternSummary> {
        let files = self
            .storage
            .list(&self.layout.input, &pattern.file_regex)
            .await?;

        let mut summary = PatternSummary {
            pattern: pattern.name.clone(),
            discovered: files.len(),
            ..Default::default()
        };
        info!(files = files.len(), "Discovered input files");

        for path in &files {
            match self.process_file(pattern, path).await? {
                FileOutcome::Loaded { .. } => summary.succeeded += 1,
                FileOutcome::Failed { .. } => summary.failed += 1,
            }
        }

        Ok(summary)
    }

    /// Process one file end to end
    pub async fn process_file(
        &self,
        pattern: &FilePattern,
        path: &str,
    ) -> IngestResult<FileOutcome> {
        let file_name = storage::file_name(path);
        let claim = self.claim(file_name, path).await?;
        let resume = claim.resume();

        let attempt_id = self
            .ledger
            .open(&NewAttempt {
                file_name: file_name.to_string(),
                file_path: path.to_string(),
                target_table: pattern.target_table.clone(),
                resume,
            })
            .await?;

        if let Some(predecessor) = &claim.predecessor {
            self.ledger
                .supersede(predecessor.attempt_id, attempt_id)
                .await?;
            info!(
                %attempt_id,
                predecessor = %predecessor.attempt_id,
                batch = resume.current_batch,
                loaded_rows = resume.loaded_rows,
                "Resuming from predecessor attempt"
            );
        }

        info!(%attempt_id, file = file_name, table = %pattern.target_table, "Attempt opened");

        match self.ingest(attempt_id, pattern, path, resume).await {
            Ok(loaded) => self.finish_success(attempt_id, file_name, path, loaded).await,
            Err(e) => self.finish_error(attempt_id, file_name, path, e).await,
        }
    }

    /// Close attempts left open by a crashed process and find the attempt to
    /// resume from
    ///
    /// Only an attempt whose file is this very input file is resumed. Records
    /// for other files that happen to share the name are left alone so their
    /// own retry still finds them.
    async fn claim(&self, file_name: &str, path: &str) -> IngestResult<Claim> {
        let mut predecessor = None;

        for record in self.ledger.list_unfinished(file_name).await? {
            let record = if record.status.is_open() {
                self.close_abandoned(record, file_name, path).await?
            } else {
                record
            };

            if predecessor.is_none() && record.resumable_at(path) {
                predecessor = Some(record);
            }
        }

        Ok(Claim { predecessor })
    }

    /// Close an attempt a crashed process left open, recording where its
    /// file actually ended up
    async fn close_abandoned(
        &self,
        record: ControlRecord,
        file_name: &str,
        path: &str,
    ) -> IngestResult<ControlRecord> {
        let attempt_id = record.attempt_id;
        warn!(
            %attempt_id,
            file = file_name,
            status = %record.status,
            "Closing abandoned attempt"
        );
        if record.status == AttemptStatus::Initiated {
            self.ledger.begin(attempt_id).await?;
        }

        match self.relocated_copy(&record, file_name).await? {
            Some((FileLocation::Archive, archived)) => {
                info!(
                    %attempt_id,
                    archived = %archived,
                    "Abandoned attempt had already archived its file"
                );
                self.ledger
                    .close_success(attempt_id, record.loaded_rows.unwrap_or(0), &archived)
                    .await?;
            },
            Some((location, located_path)) => {
                self.ledger
                    .close_error(attempt_id, ABANDONED_MESSAGE, location, &located_path)
                    .await?;
            },
            None => {
                self.ledger
                    .close_error(attempt_id, ABANDONED_MESSAGE, FileLocation::Input, path)
                    .await?;
            },
        }

        self.ledger.get(attempt_id).await
    }

    /// Find the file of an abandoned attempt in the archive or error area
    ///
    /// A crash between relocating a file and closing its record leaves the
    /// record pointing at the input area. The relocated copy carries the date
    /// of the move, which is the record's last update or today.
    async fn relocated_copy(
        &self,
        record: &ControlRecord,
        file_name: &str,
    ) -> IngestResult<Option<(FileLocation, String)>> {
        let mut dates = vec![record.modified_at.date_naive(), today()];
        dates.dedup();

        let fully_loaded = record.total_rows.is_some() && record.loaded_rows == record.total_rows;
        for date in dates {
            let archived = self.layout.archive_path(file_name, date);
            if fully_loaded && self.storage.exists(&archived).await? {
                return Ok(Some((FileLocation::Archive, archived)));
            }
            let errored = self.layout.error_path(file_name, date);
            if self.storage.exists(&errored).await? {
                return Ok(Some((FileLocation::Error, errored)));
            }
        }
        Ok(None)
    }

    async fn ingest(
        &self,
        attempt_id: Uuid,
        pattern: &FilePattern,
        path: &str,
        resume: Checkpoint,
    ) -> IngestResult<i64> {
        let format = reader::format_of(storage::file_name(path));
        let options = pattern.read_options_for(&format);
        let raw = self.storage.read(path, &format, &options).await?;
        self.ledger
            .set_total_rows(attempt_id, raw.len() as i64)
            .await?;

        let rows = SchemaMappedParser::new(pattern).parse(&raw)?;

        let schema = self.store.columns(&pattern.target_table).await?;
        ValidationGate::validate(&rows, &schema).into_result()?;

        let plan = BatchLoader::reconcile(&rows, &schema, attempt_id)?;
        let outcome = BatchLoader::new(self.store.as_ref(), self.chunk_size)
            .load(attempt_id, &pattern.target_table, &plan, resume)
            .await?;

        Ok(outcome.checkpoint.loaded_rows)
    }

    async fn finish_success(
        &self,
        attempt_id: Uuid,
        file_name: &str,
        path: &str,
        loaded: i64,
    ) -> IngestResult<FileOutcome> {
        let destination = self.layout.archive_path(file_name, today());

        if let Err(e) = self.storage.relocate(path, &destination).await {
            error!(
                %attempt_id,
                file = file_name,
                destination = %destination,
                error = %e,
                "ARCHIVE RELOCATION FAILED after a complete load; routing file to the error area"
            );
            return self.finish_error(attempt_id, file_name, path, e).await;
        }

        self.ledger
            .close_success(attempt_id, loaded, &destination)
            .await?;
        info!(%attempt_id, file = file_name, loaded_rows = loaded, "File loaded and archived");

        Ok(FileOutcome::Loaded {
            attempt_id,
            rows: loaded,
        })
    }

    async fn finish_error(
        &self,
        attempt_id: Uuid,
        file_name: &str,
        path: &str,
        cause: IngestError,
    ) -> IngestResult<FileOutcome> {
        let mut message = cause.to_string();
        warn!(%attempt_id, file = file_name, error = %message, "Attempt failed");

        let destination = self.layout.error_path(file_name, today());
        let (location, located_path) = match self.storage.relocate(path, &destination).await {
            Ok(()) => (FileLocation::Error, destination),
            Err(move_err) => {
                error!(
                    %attempt_id,
                    file = file_name,
                    error = %move_err,
                    "Error relocation failed, file left in the input area"
                );
                message = format!("{}; {}", message, move_err);
                (FileLocation::Input, path.to_string())
            },
        };

        self.ledger
            .close_error(attempt_id, &message, location, &located_path)
            .await?;

        if !cause.is_attempt_scoped() {
            return Err(cause);
        }

        Ok(FileOutcome::Failed {
            attempt_id,
            error: message,
        })
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}
