//! Relational store seam
//!
//! What the pipeline needs from the database holding the target tables:
//! live column metadata and a transactional chunk insert that commits the
//! ledger checkpoint together with the rows.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::IngestResult;
use crate::ledger::Checkpoint;
use crate::record::FieldValue;
use crate::schema::TableSchema;

/// One value slot of an insert
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Cell {
    Value(FieldValue),
    /// Let the store apply the column default
    Default,
}

/// Target column of an insert
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanColumn {
    pub name: String,
    /// Store type used to cast bound text, e.g. `int4`
    pub sql_type: Option<String>,
}

/// Reconciled rows ready for chunked insertion
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InsertPlan {
    pub columns: Vec<PlanColumn>,
    /// Each row has exactly one cell per column, in column order
    pub rows: Vec<Vec<Cell>>,
}

impl InsertPlan {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Live schema of `table`, read fresh on every call
    ///
    /// Fails with `TableNotFound` when the table has no visible columns.
    async fn columns(&self, table: &str) -> IngestResult<TableSchema>;

    /// Insert one chunk and record `checkpoint` for `attempt_id` in the same
    /// transaction
    ///
    /// Either every row and the checkpoint commit, or nothing does.
    async fn load_chunk(
        &self,
        table: &str,
        columns: &[PlanColumn],
        rows: &[Vec<Cell>],
        attempt_id: Uuid,
        checkpoint: Checkpoint,
    ) -> IngestResult<()>;
}
