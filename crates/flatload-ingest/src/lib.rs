//! flatload ingestion library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Loads structured flat files into relational tables, one file at a time,
//! with a durable per-attempt control ledger.
//!
//! # Pipeline
//!
//! - **Catalog**: named file patterns mapping positional columns to a table
//! - **Parser**: raw rows to typed rows, with required-field checks
//! - **Validation**: whole-file checks against the live table schema
//! - **Loader**: chunked inserts, each chunk committed with its checkpoint
//! - **Ledger**: the attempt state machine and audit trail
//! - **Coordinator / Retry**: discovery, routing, and requeueing
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use flatload_ingest::config::IngestConfig;
//! use flatload_ingest::postgres::{create_pool, PgStore};
//! use flatload_ingest::storage::{self, StorageLayout};
//! use flatload_ingest::PipelineCoordinator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::load(None)?;
//!     let pool = create_pool(&config.database).await?;
//!     let store = Arc::new(PgStore::new(pool, &config.pipeline.operator));
//!
//!     let coordinator = PipelineCoordinator::new(
//!         config.catalog()?,
//!         storage::from_config(&config.storage).await?,
//!         StorageLayout::from_config(&config.storage),
//!         store.clone(),
//!         store,
//!     );
//!     let summary = coordinator.run().await?;
//!     println!("{} files loaded", summary.succeeded());
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ledger;
pub mod loader;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod parser;
pub mod postgres;
pub mod record;
pub mod retry;
pub mod schema;
pub mod storage;
pub mod store;
pub mod validation;

pub use catalog::{ColumnMapping, DataType, FilePattern, SchemaCatalog};
pub use coordinator::{FileOutcome, PipelineCoordinator, RunSummary};
pub use error::{IngestError, IngestResult};
pub use ledger::{AttemptStatus, ControlLedger, ControlRecord, FileLocation};
pub use loader::BatchLoader;
pub use parser::SchemaMappedParser;
pub use record::{FieldValue, RawRow, TypedRow};
pub use retry::{RetryCoordinator, RetrySummary};
pub use validation::{ValidationGate, ValidationReport};
