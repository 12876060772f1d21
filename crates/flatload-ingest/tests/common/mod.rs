//! Shared fixtures for pipeline tests
//!
//! A [`Workspace`] is a temporary directory holding the three storage areas,
//! an in-memory store with an `orders` table, and a catalog with one
//! `orders` pattern.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use flatload_ingest::catalog::{ColumnMapping, DataType, FilePatternConfig, SchemaCatalog};
use flatload_ingest::memory::MemoryStore;
use flatload_ingest::schema::{ColumnInfo, TableSchema};
use flatload_ingest::storage::{FileStorage, LocalStorage, StorageLayout};
use flatload_ingest::{PipelineCoordinator, RetryCoordinator};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub const ORDERS: &str = "orders";

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,flatload_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// `orders` table: surrogate key, unique order number, bounded customer code
pub fn orders_schema() -> TableSchema {
    TableSchema::new(
        ORDERS,
        vec![
            ColumnInfo::new("id", "bigint", false)
                .with_default("nextval('orders_id_seq'::regclass)"),
            ColumnInfo::from_catalog("order_no", "integer", None, false),
            ColumnInfo::from_catalog("customer", "character varying", Some(8), false),
            ColumnInfo::from_catalog("amount", "numeric", None, true),
            ColumnInfo::from_catalog("order_date", "date", None, true),
            ColumnInfo::from_catalog("fragile", "boolean", None, true),
            ColumnInfo::from_catalog("load_batch_no", "text", None, true),
        ],
    )
}

/// `orders_<digits>.csv`, five positional columns
pub fn orders_pattern() -> FilePatternConfig {
    FilePatternConfig {
        file_regex: r"orders_\d+\.csv$".to_string(),
        target_table: ORDERS.to_string(),
        read_options: BTreeMap::new(),
        column_mappings: vec![
            ColumnMapping::new(0, "order_no", DataType::Integer, true),
            ColumnMapping::new(1, "customer", DataType::String, true),
            ColumnMapping::new(2, "amount", DataType::Float, false),
            ColumnMapping::new(3, "order_date", DataType::Date, false),
            ColumnMapping::new(4, "fragile", DataType::Boolean, false),
        ],
    }
}

pub fn catalog() -> SchemaCatalog {
    SchemaCatalog::from_config(&BTreeMap::from([("orders".to_string(), orders_pattern())]))
        .expect("orders pattern compiles")
}

pub struct Workspace {
    pub dir: TempDir,
    pub layout: StorageLayout,
    pub store: Arc<MemoryStore>,
    pub storage: Arc<dyn FileStorage>,
}

impl Workspace {
    /// Orders table with a unique key on `order_no`
    pub fn new() -> Self {
        Self::with_store(
            MemoryStore::new()
                .with_operator("test")
                .with_table(orders_schema())
                .with_unique(ORDERS, "order_no"),
        )
    }

    pub fn with_store(store: MemoryStore) -> Self {
        let dir = TempDir::new().unwrap();
        let area = |name: &str| dir.path().join(name).to_string_lossy().into_owned();
        let layout = StorageLayout::new(area("input"), area("archive"), area("error"));
        std::fs::create_dir_all(&layout.input).unwrap();

        Self {
            layout,
            dir,
            store: Arc::new(store),
            storage: Arc::new(LocalStorage::new()),
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn FileStorage>) -> Self {
        self.storage = storage;
        self
    }

    /// Write `lines` as an input file, one row per line
    pub fn write_input(&self, name: &str, lines: &[&str]) -> PathBuf {
        let path = PathBuf::from(self.layout.input_path(name));
        let mut content = lines.join("\n");
        content.push('\n');
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn coordinator(&self, chunk_size: usize) -> PipelineCoordinator {
        PipelineCoordinator::new(
            catalog(),
            self.storage.clone(),
            self.layout.clone(),
            self.store.clone(),
            self.store.clone(),
        )
        .with_chunk_size(chunk_size)
    }

    pub fn retry_coordinator(&self) -> RetryCoordinator {
        RetryCoordinator::new(self.storage.clone(), self.layout.clone(), self.store.clone())
    }

    /// File names currently in one storage area
    pub fn files_in(&self, area: &str) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(area) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}
