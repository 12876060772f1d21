//! Batch loader
//!
//! Reconciles parsed rows against the live schema, then inserts them in
//! fixed-size chunks. Each chunk is one store transaction that also carries
//! the ledger checkpoint, so the ledger never claims rows that were rolled
//! back.

use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};
use crate::ledger::Checkpoint;
use crate::record::{FieldValue, TypedRow};
use crate::schema::{ColumnInfo, TableSchema};
use crate::store::{Cell, InsertPlan, PlanColumn, RelationalStore};

/// Column the loader fills with the attempt id when rows do not supply it
pub const LOAD_BATCH_COLUMN: &str = "load_batch_no";

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Where a load ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOutcome {
    /// Cumulative checkpoint including any resumed progress
    pub checkpoint: Checkpoint,
    /// Chunks committed by this call
    pub chunks_committed: usize,
}

pub struct BatchLoader<'a> {
    store: &'a dyn RelationalStore,
    chunk_size: usize,
}

impl<'a> BatchLoader<'a> {
    pub fn new(store: &'a dyn RelationalStore, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Build the insert plan for `rows`
    ///
    /// Present values are kept. Absent columns are left to the store default
    /// when one exists, loaded as NULL when nullable, and otherwise fail the
    /// whole load with `MissingRequiredColumn` before any chunk is sent.
    pub fn reconcile(
        rows: &[TypedRow],
        schema: &TableSchema,
        attempt_id: Uuid,
    ) -> IngestResult<InsertPlan> {
        let extra: BTreeSet<&str> = rows
            .iter()
            .flat_map(|row| row.keys())
            .filter(|name| !schema.contains(name))
            .map(String::as_str)
            .collect();
        if !extra.is_empty() {
            warn!(
                table = %schema.table,
                columns = ?extra,
                "Dropping mapped columns that do not exist in the target table"
            );
        }

        let mut cells: Vec<Vec<Cell>> = Vec::with_capacity(rows.len());
        for (index, row) in rows.iter().enumerate() {
            let reconciled = schema
                .columns
                .iter()
                .map(|column| reconcile_cell(index, row, column, attempt_id))
                .collect::<IngestResult<Vec<_>>>()?;
            cells.push(reconciled);
        }

        // Columns every row leaves to the default are omitted entirely
        let keep: Vec<bool> = (0..schema.columns.len())
            .map(|i| cells.iter().any(|row| row[i] != Cell::Default))
            .collect();

        let columns = schema
            .columns
            .iter()
            .zip(&keep)
            .filter(|(_, keep)| **keep)
            .map(|(column, _)| PlanColumn {
                name: column.name.clone(),
                sql_type: column.sql_type.clone(),
            })
            .collect();

        let rows = cells
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .zip(&keep)
                    .filter(|(_, keep)| **keep)
                    .map(|(cell, _)| cell)
                    .collect()
            })
            .collect();

        Ok(InsertPlan { columns, rows })
    }

    /// Load `plan` chunk by chunk, continuing from `resume`
    ///
    /// The first `resume.loaded_rows` rows are already committed and are
    /// skipped. Batch numbers continue from `resume.current_batch`. The first
    /// failing chunk stops the load with `ChunkLoadFailed`; nothing after it
    /// is attempted.
    #[instrument(skip(self, plan), fields(rows = plan.len(), chunk_size = self.chunk_size))]
    pub async fn load(
        &self,
        attempt_id: Uuid,
        table: &str,
        plan: &InsertPlan,
        resume: Checkpoint,
    ) -> IngestResult<LoadOutcome> {
        let skip = usize::try_from(resume.loaded_rows.max(0)).unwrap_or(usize::MAX);
        if skip > plan.len() {
            warn!(
                %attempt_id,
                resumed_rows = skip,
                file_rows = plan.len(),
                "Resumed checkpoint is past the end of the file, nothing left to load"
            );
        }
        let remaining = plan.rows.get(skip..).unwrap_or(&[]);
        if skip > 0 {
            info!(%attempt_id, skipped = skip.min(plan.len()), "Resuming from checkpoint");
        }

        let mut checkpoint = resume;
        let mut chunks_committed = 0;

        for chunk in remaining.chunks(self.chunk_size) {
            let next = checkpoint.next(chunk.len());
            debug!(%attempt_id, batch = next.current_batch, rows = chunk.len(), "Loading chunk");

            self.store
                .load_chunk(table, &plan.columns, chunk, attempt_id, next)
                .await
                .map_err(|e| IngestError::ChunkLoadFailed {
                    batch: next.current_batch,
                    reason: e.to_string(),
                })?;

            checkpoint = next;
            chunks_committed += 1;
            debug!(
                %attempt_id,
                batch = checkpoint.current_batch,
                loaded_rows = checkpoint.loaded_rows,
                "Chunk committed"
            );
        }

        info!(
            %attempt_id,
            table,
            loaded_rows = checkpoint.loaded_rows,
            batches = checkpoint.current_batch,
            "Load complete"
        );

        Ok(LoadOutcome {
            checkpoint,
            chunks_committed,
        })
    }
}

fn reconcile_cell(
    index: usize,
    row: &TypedRow,
    column: &ColumnInfo,
    attempt_id: Uuid,
) -> IngestResult<Cell> {
    match row.get(&column.name) {
        Some(FieldValue::Null) if !column.nullable && column.has_default() => Ok(Cell::Default),
        Some(value) => Ok(Cell::Value(value.clone())),
        None if column.name == LOAD_BATCH_COLUMN => {
            Ok(Cell::Value(FieldValue::String(attempt_id.to_string())))
        },
        None if column.has_default() => Ok(Cell::Default),
        None if column.nullable => Ok(Cell::Value(FieldValue::Null)),
        None => Err(IngestError::MissingRequiredColumn {
            row: index,
            column: column.name.clone(),
        }),
    }
}
