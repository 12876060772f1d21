//! End-to-end pipeline tests
//!
//! Real files on a temporary local filesystem, with the in-memory store
//! standing in for the database. Covers:
//! 1. Successful load, archive naming and ledger counters
//! 2. Attempt-scoped failures routed to the error area
//! 3. Chunk rollback and checkpoint accounting
//! 4. Retry with and without checkpoint resume
//! 5. Relocation failures
//! 6. Infrastructure errors stopping the run

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use async_trait::async_trait;
use chrono::Utc;
use common::{init_tracing, Workspace, ORDERS};
use flatload_ingest::coordinator::ABANDONED_MESSAGE;
use flatload_ingest::ledger::{Checkpoint, ControlLedger, NewAttempt};
use flatload_ingest::memory::MemoryStore;
use flatload_ingest::record::FieldValue;
use flatload_ingest::schema::TableSchema;
use flatload_ingest::storage::{self, FileStorage, LocalStorage};
use flatload_ingest::store::{Cell, PlanColumn, RelationalStore};
use flatload_ingest::{
    AttemptStatus, FileLocation, FileOutcome, IngestError, IngestResult, PipelineCoordinator,
};
use regex::Regex;
use std::sync::Arc;

fn today_stamped(name: &str) -> String {
    storage::stamped_name(name, Utc::now().date_naive())
}

/// Local storage whose relocations into chosen areas always fail
struct FlakyStorage {
    inner: LocalStorage,
    blocked: Vec<String>,
}

impl FlakyStorage {
    fn blocking(areas: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            inner: LocalStorage::new(),
            blocked: areas.iter().map(|a| a.to_string()).collect(),
        })
    }
}

#[async_trait]
impl FileStorage for FlakyStorage {
    async fn list(&self, location: &str, pattern: &Regex) -> IngestResult<Vec<String>> {
        self.inner.list(location, pattern).await
    }

    async fn fetch(&self, path: &str) -> IngestResult<Vec<u8>> {
        self.inner.fetch(path).await
    }

    async fn exists(&self, path: &str) -> IngestResult<bool> {
        self.inner.exists(path).await
    }

    async fn relocate(&self, from: &str, to: &str) -> IngestResult<()> {
        if self.blocked.iter().any(|area| to.starts_with(area.as_str())) {
            return Err(IngestError::RelocationFailed {
                from: from.to_string(),
                to: to.to_string(),
                reason: "permission denied".to_string(),
            });
        }
        self.inner.relocate(from, to).await
    }
}

#[tokio::test]
async fn test_successful_load_is_archived_and_counted() {
    init_tracing();
    let ws = Workspace::new();
    ws.write_input(
        "orders_1.csv",
        &[
            "101,ACME,12.50,2024-03-01,Y",
            "102,GLOBEX,7,2024-03-02,no",
            "103,INITECH,,,",
        ],
    );

    let summary = ws.coordinator(2).run().await.unwrap();
    assert_eq!(summary.discovered(), 1);
    assert_eq!(summary.succeeded(), 1);
    assert_eq!(summary.failed(), 0);

    let records = ws.store.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.status, AttemptStatus::Success);
    assert_eq!(record.total_rows, Some(3));
    assert_eq!(record.loaded_rows, Some(3));
    assert_eq!(record.current_batch, Some(2));
    assert_eq!(record.file_location, FileLocation::Archive);
    assert!(record.located_path.ends_with(&today_stamped("orders_1.csv")));
    assert_eq!(record.created_by, "test");

    assert!(ws.files_in(&ws.layout.input).is_empty());
    assert_eq!(ws.files_in(&ws.layout.archive), vec![today_stamped("orders_1.csv")]);

    let rows = ws.store.rows(ORDERS);
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["id"], FieldValue::Integer(1));
    assert_eq!(rows[2]["id"], FieldValue::Integer(3));
    assert_eq!(rows[1]["customer"], FieldValue::from("GLOBEX"));
    assert_eq!(rows[2]["amount"], FieldValue::Null);
    let batch_no = FieldValue::String(record.attempt_id.to_string());
    assert!(rows.iter().all(|row| row["load_batch_no"] == batch_no));
}

#[tokio::test]
async fn test_unmatched_files_are_left_alone() {
    let ws = Workspace::new();
    ws.write_input("orders_1.csv", &["1,ACME,1.0,2024-01-01,Y"]);
    ws.write_input("notes.txt", &["not an order file"]);
    ws.write_input("archived_orders_2.csv", &["2,ACME,1.0,2024-01-01,Y"]);

    let summary = ws.coordinator(10).run().await.unwrap();

    assert_eq!(summary.discovered(), 1);
    assert_eq!(
        ws.files_in(&ws.layout.input),
        vec!["archived_orders_2.csv".to_string(), "notes.txt".to_string()]
    );
}

#[tokio::test]
async fn test_narrow_file_is_schema_mismatch() {
    let ws = Workspace::new();
    ws.write_input("orders_1.csv", &["101,ACME", "102,GLOBEX"]);

    let summary = ws.coordinator(10).run().await.unwrap();
    assert_eq!(summary.failed(), 1);

    let record = &ws.store.records()[0];
    assert_eq!(record.status, AttemptStatus::Error);
    assert_eq!(record.file_location, FileLocation::Error);
    assert_eq!(record.total_rows, Some(2));
    assert_eq!(record.loaded_rows, Some(0));
    let message = record.error_message.as_deref().unwrap();
    assert!(message.contains("Schema mismatch"), "{message}");
    assert!(message.contains("requires at least 5"), "{message}");

    assert_eq!(ws.files_in(&ws.layout.error), vec![today_stamped("orders_1.csv")]);
    assert!(ws.files_in(&ws.layout.input).is_empty());
    assert_eq!(ws.store.row_count(ORDERS), 0);
}

#[tokio::test]
async fn test_empty_file_is_schema_mismatch() {
    let ws = Workspace::new();
    std::fs::write(ws.layout.input_path("orders_1.csv"), "").unwrap();

    ws.coordinator(10).run().await.unwrap();

    let record = &ws.store.records()[0];
    assert_eq!(record.status, AttemptStatus::Error);
    assert_eq!(record.total_rows, Some(0));
    assert!(record.error_message.as_deref().unwrap().contains("file has 0 columns"));
}

#[tokio::test]
async fn test_validation_failure_loads_nothing() {
    let ws = Workspace::new();
    ws.write_input(
        "orders_1.csv",
        &[
            "101,ACME,1.0,2024-01-01,Y",
            "102,VERYLONGCUSTOMER,1.0,2024-01-01,Y",
        ],
    );

    ws.coordinator(1).run().await.unwrap();

    let record = &ws.store.records()[0];
    assert_eq!(record.status, AttemptStatus::Error);
    assert_eq!(record.current_batch, Some(0));
    assert_eq!(
        record.error_message.as_deref(),
        Some(concat!(
            "Data validation failed: ",
            "Values exceeding max length (8) in column customer at rows: [1]"
        ))
    );
    assert_eq!(ws.store.row_count(ORDERS), 0);
}

#[tokio::test]
async fn test_required_field_missing_names_row_and_column() {
    let ws = Workspace::new();
    ws.write_input("orders_1.csv", &["101,ACME,1.0,,", "102,,1.0,,"]);

    let outcome = ws.coordinator(10).run().await.unwrap();
    assert_eq!(outcome.failed(), 1);

    let message = ws.store.records()[0].error_message.clone().unwrap();
    assert_eq!(message, "Required field 'customer' is empty in row 1");
}

#[tokio::test]
async fn test_unknown_boolean_token_loads_false() {
    let ws = Workspace::new();
    ws.write_input("orders_1.csv", &["101,ACME,1.0,2024-01-01,maybe"]);

    ws.coordinator(10).run().await.unwrap();

    assert_eq!(ws.store.records()[0].status, AttemptStatus::Success);
    assert_eq!(ws.store.rows(ORDERS)[0]["fragile"], FieldValue::Boolean(false));
}

#[tokio::test]
async fn test_missing_target_table_is_recorded() {
    let ws = Workspace::with_store(MemoryStore::new());
    ws.write_input("orders_1.csv", &["101,ACME,1.0,2024-01-01,Y"]);

    let summary = ws.coordinator(10).run().await.unwrap();

    assert_eq!(summary.failed(), 1);
    let record = &ws.store.records()[0];
    assert_eq!(
        record.error_message.as_deref(),
        Some("Table 'orders' not found or has no columns")
    );
    assert_eq!(record.file_location, FileLocation::Error);
}

/// Three rows, chunk size two, the third row repeats the first order number
async fn failing_chunk_run(ws: &Workspace) {
    ws.write_input(
        "orders_1.csv",
        &[
            "101,ACME,1.0,2024-01-01,Y",
            "102,GLOBEX,2.0,2024-01-02,N",
            "101,INITECH,3.0,2024-01-03,Y",
        ],
    );

    let summary = ws.coordinator(2).run().await.unwrap();
    assert_eq!(summary.failed(), 1);
}

#[tokio::test]
async fn test_failed_chunk_rolls_back_and_keeps_checkpoint() {
    let ws = Workspace::new();
    failing_chunk_run(&ws).await;

    let record = &ws.store.records()[0];
    assert_eq!(record.status, AttemptStatus::Error);
    assert_eq!(record.total_rows, Some(3));
    assert_eq!(record.loaded_rows, Some(2));
    assert_eq!(record.current_batch, Some(1));
    assert_eq!(record.file_location, FileLocation::Error);
    let message = record.error_message.as_deref().unwrap();
    assert!(message.starts_with("Error loading batch 2:"), "{message}");
    assert!(message.contains("duplicate key"), "{message}");

    // Only the committed chunk is in the table
    assert_eq!(ws.store.row_count(ORDERS), 2);
    assert_eq!(ws.files_in(&ws.layout.error), vec![today_stamped("orders_1.csv")]);
}

#[tokio::test]
async fn test_retry_from_scratch_resets_checkpoint() {
    let ws = Workspace::new();
    failing_chunk_run(&ws).await;

    let summary = ws.retry_coordinator().retry(false).await.unwrap();
    assert_eq!(summary.requeued, 1);
    assert_eq!(summary.failed, 0);

    let record = &ws.store.records()[0];
    assert_eq!(record.status, AttemptStatus::PendingRetry);
    assert_eq!(record.file_location, FileLocation::Input);
    assert_eq!(record.located_path, ws.layout.input_path("orders_1.csv"));
    assert_eq!(record.checkpoint(), Checkpoint::new(0, 0));

    assert_eq!(ws.files_in(&ws.layout.input), vec!["orders_1.csv".to_string()]);
    assert!(ws.files_in(&ws.layout.error).is_empty());

    // Already requeued; a second pass finds nothing
    let again = ws.retry_coordinator().retry(false).await.unwrap();
    assert_eq!(again.requeued, 0);
}

#[tokio::test]
async fn test_retry_with_resume_continues_after_committed_rows() {
    let ws = Workspace::new();
    failing_chunk_run(&ws).await;
    let first = ws.store.records()[0].attempt_id;

    ws.retry_coordinator().retry(true).await.unwrap();
    assert_eq!(ws.store.records()[0].checkpoint(), Checkpoint::new(1, 2));

    // Fix the offending row, keep the committed ones as they were
    ws.write_input(
        "orders_1.csv",
        &[
            "101,ACME,1.0,2024-01-01,Y",
            "102,GLOBEX,2.0,2024-01-02,N",
            "103,INITECH,3.0,2024-01-03,Y",
        ],
    );

    let summary = ws.coordinator(2).run().await.unwrap();
    assert_eq!(summary.succeeded(), 1);

    let records = ws.store.records();
    assert_eq!(records.len(), 2);
    let second = &records[1];
    assert_eq!(records[0].status, AttemptStatus::PendingRetry);
    assert_eq!(records[0].superseded_by, Some(second.attempt_id));
    assert_ne!(second.attempt_id, first);
    assert_eq!(second.status, AttemptStatus::Success);
    assert_eq!(second.loaded_rows, Some(3));
    assert_eq!(second.current_batch, Some(2));

    // No duplicates: only the third row was inserted again
    let order_nos: Vec<FieldValue> = ws
        .store
        .rows(ORDERS)
        .iter()
        .map(|r| r["order_no"].clone())
        .collect();
    assert_eq!(
        order_nos,
        vec![FieldValue::Integer(101), FieldValue::Integer(102), FieldValue::Integer(103)]
    );

    // Superseded records are not offered for retry again
    assert!(ws.store.list_errors().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_retry_skips_when_input_has_same_name() {
    let ws = Workspace::new();
    failing_chunk_run(&ws).await;
    ws.write_input("orders_1.csv", &["201,ACME,1.0,2024-01-01,Y"]);

    let summary = ws.retry_coordinator().retry(true).await.unwrap();

    assert_eq!(summary.requeued, 0);
    assert_eq!(summary.skipped, 1);
    let record = &ws.store.records()[0];
    assert_eq!(record.status, AttemptStatus::Error);
    assert_eq!(ws.files_in(&ws.layout.error).len(), 1);
}

#[tokio::test]
async fn test_abandoned_attempt_is_closed_before_reprocessing() {
    let ws = Workspace::new();
    let path = ws.write_input("orders_7.csv", &["701,ACME,1.0,2024-01-01,Y"]);
    let path = path.to_string_lossy().into_owned();

    // A crashed run left this attempt open
    let stale = ws
        .store
        .open(&NewAttempt {
            file_name: "orders_7.csv".to_string(),
            file_path: path.clone(),
            target_table: ORDERS.to_string(),
            resume: Checkpoint::default(),
        })
        .await
        .unwrap();

    let summary = ws.coordinator(10).run().await.unwrap();
    assert_eq!(summary.succeeded(), 1);

    let old = ws.store.get(stale).await.unwrap();
    assert_eq!(old.status, AttemptStatus::Error);
    assert_eq!(old.error_message.as_deref(), Some(ABANDONED_MESSAGE));
    assert_eq!(old.file_location, FileLocation::Input);
    assert!(old.superseded_by.is_some());

    let new = ws.store.get(old.superseded_by.unwrap()).await.unwrap();
    assert_eq!(new.status, AttemptStatus::Success);
    assert_eq!(ws.store.row_count(ORDERS), 1);
}

#[tokio::test]
async fn test_reused_name_is_loaded_in_full() {
    let ws = Workspace::new();
    failing_chunk_run(&ws).await;
    let failed = ws.store.records()[0].attempt_id;

    // A different file with the same name, while the failed one still sits
    // in the error area
    ws.write_input(
        "orders_1.csv",
        &[
            "301,ACME,1.0,2024-02-01,Y",
            "302,GLOBEX,2.0,2024-02-02,N",
            "303,INITECH,3.0,2024-02-03,Y",
        ],
    );

    let summary = ws.coordinator(2).run().await.unwrap();
    assert_eq!(summary.succeeded(), 1);

    let records = ws.store.records();
    let new = &records[1];
    assert_eq!(new.status, AttemptStatus::Success);
    assert_eq!(new.total_rows, Some(3));
    assert_eq!(new.loaded_rows, Some(3));
    assert_eq!(new.current_batch, Some(2));

    let order_nos: Vec<FieldValue> = ws
        .store
        .rows(ORDERS)
        .iter()
        .map(|r| r["order_no"].clone())
        .collect();
    assert_eq!(
        order_nos,
        [101, 102, 301, 302, 303].map(FieldValue::Integer).to_vec()
    );

    // The failed attempt keeps its own checkpoint and can still be retried
    let old = ws.store.get(failed).await.unwrap();
    assert_eq!(old.status, AttemptStatus::Error);
    assert_eq!(old.superseded_by, None);
    assert_eq!(old.checkpoint(), Checkpoint::new(1, 2));
    assert_eq!(ws.store.list_errors().await.unwrap().len(), 1);

    let retried = ws.retry_coordinator().retry(true).await.unwrap();
    assert_eq!(retried.requeued, 1);
    assert_eq!(ws.files_in(&ws.layout.input), vec!["orders_1.csv".to_string()]);
}

/// Open an attempt as a crashed run would have left it
async fn stale_attempt(ws: &Workspace, name: &str, total: i64, loaded: i64) -> uuid::Uuid {
    let id = ws
        .store
        .open(&NewAttempt {
            file_name: name.to_string(),
            file_path: ws.layout.input_path(name),
            target_table: ORDERS.to_string(),
            resume: Checkpoint::default(),
        })
        .await
        .unwrap();
    ws.store.set_total_rows(id, total).await.unwrap();
    if loaded > 0 {
        ws.store
            .advance(id, Checkpoint::new(1, loaded))
            .await
            .unwrap();
    }
    id
}

fn place(path: &str, content: &str) {
    let path = std::path::Path::new(path);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

#[tokio::test]
async fn test_crash_after_archiving_does_not_resume_new_file() {
    let ws = Workspace::new();
    let stale = stale_attempt(&ws, "orders_7.csv", 1, 1).await;
    let archived = ws.layout.archive_path("orders_7.csv", Utc::now().date_naive());
    place(&archived, "701,ACME,1.0,2024-01-01,Y\n");

    ws.write_input("orders_7.csv", &["702,GLOBEX,1.0,2024-01-02,N"]);
    let summary = ws.coordinator(10).run().await.unwrap();
    assert_eq!(summary.succeeded(), 1);

    let old = ws.store.get(stale).await.unwrap();
    assert_eq!(old.status, AttemptStatus::Success);
    assert_eq!(old.file_location, FileLocation::Archive);
    assert_eq!(old.located_path, archived);
    assert_eq!(old.superseded_by, None);

    let new = ws.store.records().pop().unwrap();
    assert_ne!(new.attempt_id, stale);
    assert_eq!(new.loaded_rows, Some(1));
    assert_eq!(ws.store.rows(ORDERS)[0]["order_no"], FieldValue::Integer(702));
}

#[tokio::test]
async fn test_crash_after_error_move_keeps_record_retryable() {
    let ws = Workspace::new();
    let stale = stale_attempt(&ws, "orders_8.csv", 3, 2).await;
    let errored = ws.layout.error_path("orders_8.csv", Utc::now().date_naive());
    place(&errored, "801,ACME\n");

    ws.write_input("orders_8.csv", &["802,GLOBEX,1.0,2024-01-02,N"]);
    ws.coordinator(10).run().await.unwrap();

    let old = ws.store.get(stale).await.unwrap();
    assert_eq!(old.status, AttemptStatus::Error);
    assert_eq!(old.error_message.as_deref(), Some(ABANDONED_MESSAGE));
    assert_eq!(old.file_location, FileLocation::Error);
    assert_eq!(old.located_path, errored);
    assert_eq!(old.superseded_by, None);

    let errors = ws.store.list_errors().await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].attempt_id, stale);
    assert_eq!(ws.store.row_count(ORDERS), 1);
}

#[tokio::test]
async fn test_archive_failure_routes_loaded_file_to_error_area() {
    let ws = Workspace::new();
    let storage = FlakyStorage::blocking(&[ws.layout.archive.as_str()]);
    let ws = ws.with_storage(storage);
    ws.write_input("orders_1.csv", &["101,ACME,1.0,2024-01-01,Y"]);

    let summary = ws.coordinator(10).run().await.unwrap();
    assert_eq!(summary.failed(), 1);

    let record = &ws.store.records()[0];
    assert_eq!(record.status, AttemptStatus::Error);
    assert_eq!(record.file_location, FileLocation::Error);
    assert_eq!(record.loaded_rows, Some(1));
    assert!(record.error_message.as_deref().unwrap().contains("permission denied"));

    // Rows stay committed; the operator decides what to do with them
    assert_eq!(ws.store.row_count(ORDERS), 1);
    assert_eq!(ws.files_in(&ws.layout.error), vec![today_stamped("orders_1.csv")]);
}

#[tokio::test]
async fn test_error_relocation_failure_leaves_file_in_input() {
    let ws = Workspace::new();
    let storage = FlakyStorage::blocking(&[ws.layout.error.as_str()]);
    let ws = ws.with_storage(storage);
    ws.write_input("orders_1.csv", &["101,ACME"]);

    let summary = ws.coordinator(10).run().await.unwrap();
    assert_eq!(summary.failed(), 1);

    let record = &ws.store.records()[0];
    assert_eq!(record.status, AttemptStatus::Error);
    assert_eq!(record.file_location, FileLocation::Input);
    assert_eq!(record.located_path, ws.layout.input_path("orders_1.csv"));
    let message = record.error_message.as_deref().unwrap();
    assert!(message.starts_with("Schema mismatch"), "{message}");
    assert!(message.contains("permission denied"), "{message}");
    assert_eq!(ws.files_in(&ws.layout.input), vec!["orders_1.csv".to_string()]);
}

/// Store whose schema lookups fail as if the connection dropped
struct DisconnectedStore {
    inner: Arc<MemoryStore>,
}

#[async_trait]
impl RelationalStore for DisconnectedStore {
    async fn columns(&self, _table: &str) -> IngestResult<TableSchema> {
        Err(IngestError::storage("connection reset by peer"))
    }

    async fn load_chunk(
        &self,
        table: &str,
        columns: &[PlanColumn],
        rows: &[Vec<Cell>],
        attempt_id: uuid::Uuid,
        checkpoint: Checkpoint,
    ) -> IngestResult<()> {
        self.inner
            .load_chunk(table, columns, rows, attempt_id, checkpoint)
            .await
    }
}

#[tokio::test]
async fn test_infrastructure_error_closes_attempt_and_stops_run() {
    init_tracing();
    let ws = Workspace::new();
    ws.write_input("orders_1.csv", &["101,ACME,1.0,2024-01-01,Y"]);
    ws.write_input("orders_2.csv", &["201,ACME,1.0,2024-01-01,Y"]);

    let coordinator = PipelineCoordinator::new(
        common::catalog(),
        ws.storage.clone(),
        ws.layout.clone(),
        Arc::new(DisconnectedStore {
            inner: ws.store.clone(),
        }),
        ws.store.clone(),
    );

    let err = coordinator.run().await.unwrap_err();
    assert!(matches!(err, IngestError::Storage(ref m) if m.contains("connection reset")));

    // The attempt in flight is closed before the run stops
    let records = ws.store.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.file_name, "orders_1.csv");
    assert_eq!(record.status, AttemptStatus::Error);
    assert_eq!(record.file_location, FileLocation::Error);
    assert!(record.error_message.as_deref().unwrap().contains("connection reset"));
    assert_eq!(ws.files_in(&ws.layout.error), vec![today_stamped("orders_1.csv")]);

    // Nothing after it is touched
    assert_eq!(ws.files_in(&ws.layout.input), vec!["orders_2.csv".to_string()]);
    assert_eq!(ws.store.row_count(ORDERS), 0);
}

#[tokio::test]
async fn test_process_file_reports_outcome() {
    let ws = Workspace::new();
    let path = ws.write_input(
        "orders_3.csv",
        &["301,ACME,1.0,2024-01-01,Y", "302,ACME,1.0,2024-01-01,Y"],
    );
    let coordinator = ws.coordinator(10);
    let pattern = coordinator.catalog().get("orders").unwrap().clone();

    let outcome = coordinator
        .process_file(&pattern, &path.to_string_lossy())
        .await
        .unwrap();

    match outcome {
        FileOutcome::Loaded { attempt_id, rows } => {
            assert_eq!(rows, 2);
            assert_eq!(ws.store.get(attempt_id).await.unwrap().status, AttemptStatus::Success);
        },
        other => panic!("expected a load, got {other:?}"),
    }
}
