//! Retry coordinator
//!
//! Requeues failed files: moves each one from the error area back to the
//! input area and marks its record PENDING_RETRY. Loading is left to the next
//! discovery pass, which opens a fresh attempt.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::IngestResult;
use crate::ledger::{ControlLedger, FileLocation};
use crate::storage::{FileStorage, StorageLayout};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub requeued: usize,
    /// A file with the same name already waits in the input area
    pub skipped: usize,
    /// The file could not be moved back
    pub failed: usize,
}

pub struct RetryCoordinator {
    storage: Arc<dyn FileStorage>,
    layout: StorageLayout,
    ledger: Arc<dyn ControlLedger>,
}

impl RetryCoordinator {
    pub fn new(
        storage: Arc<dyn FileStorage>,
        layout: StorageLayout,
        ledger: Arc<dyn ControlLedger>,
    ) -> Self {
        Self {
            storage,
            layout,
            ledger,
        }
    }

    /// Requeue every unresumed ERROR record
    ///
    /// With `resume_from_checkpoint` false the record's batch and row
    /// counters are reset to zero so the next attempt starts over.
    pub async fn retry(&self, resume_from_checkpoint: bool) -> IngestResult<RetrySummary> {
        let mut summary = RetrySummary::default();

        for record in self.ledger.list_errors().await? {
            let input_path = self.layout.input_path(&record.file_name);

            if record.file_location != FileLocation::Input {
                if self.storage.exists(&input_path).await? {
                    warn!(
                        attempt_id = %record.attempt_id,
                        file = %record.file_name,
                        "A file with the same name is already in the input area, skipping"
                    );
                    summary.skipped += 1;
                    continue;
                }

                if let Err(e) = self
                    .storage
                    .relocate(&record.located_path, &input_path)
                    .await
                {
                    warn!(
                        attempt_id = %record.attempt_id,
                        file = %record.file_name,
                        error = %e,
                        "Could not move file back to the input area"
                    );
                    summary.failed += 1;
                    continue;
                }
            }

            let located_path = if record.file_location == FileLocation::Input {
                record.located_path.clone()
            } else {
                input_path
            };

            self.ledger
                .mark_pending_retry(record.attempt_id, &located_path, !resume_from_checkpoint)
                .await?;
            summary.requeued += 1;

            info!(
                attempt_id = %record.attempt_id,
                file = %record.file_name,
                resume = resume_from_checkpoint,
                "File requeued"
            );
        }

        info!(
            requeued = summary.requeued,
            skipped = summary.skipped,
            failed = summary.failed,
            "Retry pass complete"
        );
        Ok(summary)
    }
}
