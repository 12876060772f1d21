//! In-memory relational store and ledger
//!
//! Tables and ledger live under one mutex so a chunk insert and its
//! checkpoint commit or fail together, the same way they share a transaction
//! in Postgres. Column constraints (not-null, integer and numeric types,
//! bounded text, declared unique keys) are emulated so rejected rows roll
//! back the whole chunk.

use async_trait::async_trait;
use chrono::Utc;
use flatload_common::FlatloadError;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};
use crate::ledger::{
    AttemptStatus, Checkpoint, ControlLedger, ControlRecord, FileLocation, LedgerFilter,
    NewAttempt,
};
use crate::record::FieldValue;
use crate::schema::{ColumnInfo, ColumnKind, TableSchema};
use crate::store::{Cell, PlanColumn, RelationalStore};

/// Stored row keyed by column name
pub type StoredRow = BTreeMap<String, FieldValue>;

#[derive(Debug, Default)]
struct MemoryTable {
    schema: Option<TableSchema>,
    unique: BTreeSet<String>,
    rows: Vec<StoredRow>,
    sequence: i64,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, MemoryTable>,
    records: Vec<ControlRecord>,
}

#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    operator: String,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            operator: "SYSTEM".to_string(),
        }
    }

    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = operator.into();
        self
    }

    pub fn with_table(self, schema: TableSchema) -> Self {
        {
            let mut state = self.lock();
            let table = state.tables.entry(schema.table.clone()).or_default();
            table.schema = Some(schema);
        }
        self
    }

    /// Declare a unique key on one column
    pub fn with_unique(self, table: &str, column: &str) -> Self {
        {
            let mut state = self.lock();
            state
                .tables
                .entry(table.to_string())
                .or_default()
                .unique
                .insert(column.to_string());
        }
        self
    }

    pub fn rows(&self, table: &str) -> Vec<StoredRow> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Every record in creation order
    pub fn records(&self) -> Vec<ControlRecord> {
        self.lock().records.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-write
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update<F>(&self, attempt_id: Uuid, f: F) -> IngestResult<()>
    where
        F: FnOnce(&mut ControlRecord) -> IngestResult<()>,
    {
        let mut state = self.lock();
        let record = find_mut(&mut state.records, attempt_id)?;
        f(record)?;
        record.modified_at = Utc::now();
        record.modified_by = self.operator.clone();
        Ok(())
    }
}

fn find_mut(records: &mut [ControlRecord], attempt_id: Uuid) -> IngestResult<&mut ControlRecord> {
    records
        .iter_mut()
        .find(|r| r.attempt_id == attempt_id)
        .ok_or(IngestError::AttemptNotFound(attempt_id))
}

fn constraint(message: String) -> IngestError {
    IngestError::Common(FlatloadError::Database(message))
}

/// Apply column constraints to one value
fn check_value(table: &str, column: &ColumnInfo, value: &FieldValue) -> IngestResult<()> {
    let valid = match (column.kind, value) {
        (_, FieldValue::Null) => column.nullable,
        (ColumnKind::Integer, FieldValue::Integer(_)) => true,
        (ColumnKind::Integer, FieldValue::String(s)) => s.trim().parse::<i64>().is_ok(),
        (ColumnKind::Integer, _) => false,
        (ColumnKind::Decimal, FieldValue::Integer(_) | FieldValue::Float(_)) => true,
        (ColumnKind::Decimal, FieldValue::String(s)) => s.trim().parse::<f64>().is_ok(),
        (ColumnKind::Decimal, _) => false,
        (ColumnKind::BoundedText(max), v) => {
            v.render().is_none_or(|text| text.chars().count() <= max)
        },
        _ => true,
    };

    if valid {
        Ok(())
    } else if value.is_null() {
        Err(constraint(format!(
            "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
            column.name, table
        )))
    } else {
        Err(constraint(format!(
            "invalid value {:?} for column \"{}\" ({}) of relation \"{}\"",
            value.render().unwrap_or_default(),
            column.name,
            column.data_type,
            table
        )))
    }
}

fn default_value(column: &ColumnInfo, sequence: &mut i64) -> FieldValue {
    match column.default.as_deref() {
        Some(expr) if expr.starts_with("nextval") => {
            *sequence += 1;
            FieldValue::Integer(*sequence)
        },
        Some(expr) => FieldValue::String(expr.trim_matches('\'').to_string()),
        None => FieldValue::Null,
    }
}

#[async_trait]
impl RelationalStore for MemoryStore {
    async fn columns(&self, table: &str) -> IngestResult<TableSchema> {
        self.lock()
            .tables
            .get(table)
            .and_then(|t| t.schema.clone())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| IngestError::TableNotFound(table.to_string()))
    }

    async fn load_chunk(
        &self,
        table: &str,
        columns: &[PlanColumn],
        rows: &[Vec<Cell>],
        attempt_id: Uuid,
        checkpoint: Checkpoint,
    ) -> IngestResult<()> {
        let mut state = self.lock();
        let State { tables, records } = &mut *state;

        let record = find_mut(records, attempt_id)?;
        record
            .accepts(checkpoint)
            .map_err(|reason| IngestError::CheckpointRejected { attempt_id, reason })?;

        let target = tables
            .get_mut(table)
            .ok_or_else(|| IngestError::TableNotFound(table.to_string()))?;
        let schema = target
            .schema
            .clone()
            .ok_or_else(|| IngestError::TableNotFound(table.to_string()))?;

        for column in columns {
            if !schema.contains(&column.name) {
                return Err(constraint(format!(
                    "column \"{}\" of relation \"{}\" does not exist",
                    column.name, table
                )));
            }
        }

        // Stage everything first; nothing is written unless all rows pass
        let mut sequence = target.sequence;
        let mut staged: Vec<StoredRow> = Vec::with_capacity(rows.len());
        for cells in rows {
            let mut stored = StoredRow::new();
            for info in &schema.columns {
                let cell = columns
                    .iter()
                    .position(|c| c.name == info.name)
                    .and_then(|i| cells.get(i));
                let value = match cell {
                    Some(Cell::Value(v)) => v.clone(),
                    Some(Cell::Default) | None => default_value(info, &mut sequence),
                };
                check_value(table, info, &value)?;
                stored.insert(info.name.clone(), value);
            }

            for key in &target.unique {
                let Some(value) = stored.get(key).filter(|v| !v.is_null()) else {
                    continue;
                };
                let duplicate = target
                    .rows
                    .iter()
                    .chain(staged.iter())
                    .any(|existing| existing.get(key) == Some(value));
                if duplicate {
                    return Err(constraint(format!(
                        "duplicate key value violates unique constraint on \"{}\".\"{}\"",
                        table, key
                    )));
                }
            }

            staged.push(stored);
        }

        target.rows.extend(staged);
        target.sequence = sequence;
        record.current_batch = Some(checkpoint.current_batch);
        record.loaded_rows = Some(checkpoint.loaded_rows);
        record.modified_at = Utc::now();
        record.modified_by = self.operator.clone();
        Ok(())
    }
}

#[async_trait]
impl ControlLedger for MemoryStore {
    async fn open(&self, attempt: &NewAttempt) -> IngestResult<Uuid> {
        let attempt_id = Uuid::new_v4();
        let now = Utc::now();
        self.lock().records.push(ControlRecord {
            attempt_id,
            file_name: attempt.file_name.clone(),
            file_path: attempt.file_path.clone(),
            target_table: attempt.target_table.clone(),
            status: AttemptStatus::Initiated,
            total_rows: None,
            loaded_rows: Some(attempt.resume.loaded_rows),
            current_batch: Some(attempt.resume.current_batch),
            error_message: None,
            file_location: FileLocation::Input,
            located_path: attempt.file_path.clone(),
            superseded_by: None,
            created_at: now,
            modified_at: now,
            created_by: self.operator.clone(),
            modified_by: self.operator.clone(),
        });

        self.begin(attempt_id).await?;
        Ok(attempt_id)
    }

    async fn begin(&self, attempt_id: Uuid) -> IngestResult<()> {
        self.update(attempt_id, |record| {
            record
                .status
                .ensure_transition(attempt_id, AttemptStatus::InProgress)?;
            record.status = AttemptStatus::InProgress;
            Ok(())
        })
    }

    async fn set_total_rows(&self, attempt_id: Uuid, total_rows: i64) -> IngestResult<()> {
        self.update(attempt_id, |record| {
            if !record.status.is_open() {
                return Err(IngestError::CheckpointRejected {
                    attempt_id,
                    reason: format!("attempt is {}", record.status),
                });
            }
            let loaded = record.loaded_rows.unwrap_or(0);
            if loaded > total_rows {
                return Err(IngestError::CheckpointRejected {
                    attempt_id,
                    reason: format!("loaded rows {} exceed total rows {}", loaded, total_rows),
                });
            }
            record.total_rows = Some(total_rows);
            Ok(())
        })
    }

    async fn advance(&self, attempt_id: Uuid, checkpoint: Checkpoint) -> IngestResult<()> {
        self.update(attempt_id, |record| {
            record
                .accepts(checkpoint)
                .map_err(|reason| IngestError::CheckpointRejected { attempt_id, reason })?;
            record.current_batch = Some(checkpoint.current_batch);
            record.loaded_rows = Some(checkpoint.loaded_rows);
            Ok(())
        })
    }

    async fn close_success(
        &self,
        attempt_id: Uuid,
        total_loaded: i64,
        located_path: &str,
    ) -> IngestResult<()> {
        self.update(attempt_id, |record| {
            record
                .status
                .ensure_transition(attempt_id, AttemptStatus::Success)?;
            record.status = AttemptStatus::Success;
            record.loaded_rows = Some(total_loaded);
            record.file_location = FileLocation::Archive;
            record.located_path = located_path.to_string();
            Ok(())
        })
    }

    async fn close_error(
        &self,
        attempt_id: Uuid,
        message: &str,
        location: FileLocation,
        located_path: &str,
    ) -> IngestResult<()> {
        self.update(attempt_id, |record| {
            record
                .status
                .ensure_transition(attempt_id, AttemptStatus::Error)?;
            record.status = AttemptStatus::Error;
            record.error_message = Some(message.to_string());
            record.file_location = location;
            record.located_path = located_path.to_string();
            Ok(())
        })
    }

    async fn list_errors(&self) -> IngestResult<Vec<ControlRecord>> {
        Ok(self
            .lock()
            .records
            .iter()
            .filter(|r| r.status == AttemptStatus::Error && r.superseded_by.is_none())
            .cloned()
            .collect())
    }

    async fn get(&self, attempt_id: Uuid) -> IngestResult<ControlRecord> {
        self.lock()
            .records
            .iter()
            .find(|r| r.attempt_id == attempt_id)
            .cloned()
            .ok_or(IngestError::AttemptNotFound(attempt_id))
    }

    async fn list(&self, filter: &LedgerFilter) -> IngestResult<Vec<ControlRecord>> {
        let limit = filter
            .limit
            .and_then(|l| usize::try_from(l).ok())
            .unwrap_or(usize::MAX);
        Ok(self
            .lock()
            .records
            .iter()
            .rev()
            .filter(|r| filter.matches(r))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_unfinished(&self, file_name: &str) -> IngestResult<Vec<ControlRecord>> {
        Ok(self
            .lock()
            .records
            .iter()
            .rev()
            .filter(|r| {
                r.file_name == file_name
                    && r.status != AttemptStatus::Success
                    && r.superseded_by.is_none()
            })
            .cloned()
            .collect())
    }

    async fn supersede(&self, attempt_id: Uuid, successor: Uuid) -> IngestResult<()> {
        self.update(attempt_id, |record| {
            record.superseded_by = Some(successor);
            Ok(())
        })
    }

    async fn mark_pending_retry(
        &self,
        attempt_id: Uuid,
        located_path: &str,
        reset_checkpoint: bool,
    ) -> IngestResult<()> {
        self.update(attempt_id, |record| {
            record
                .status
                .ensure_transition(attempt_id, AttemptStatus::PendingRetry)?;
            record.status = AttemptStatus::PendingRetry;
            record.file_location = FileLocation::Input;
            record.located_path = located_path.to_string();
            if reset_checkpoint {
                record.current_batch = Some(0);
                record.loaded_rows = Some(0);
            }
            Ok(())
        })
    }
}
