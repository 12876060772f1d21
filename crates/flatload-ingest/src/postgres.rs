//! Postgres backend
//!
//! `PgStore` serves both the relational store and the control ledger from
//! one pool, so a chunk insert and its checkpoint update share a transaction.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Executor, Postgres, QueryBuilder, Row};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::{IngestError, IngestResult};
use crate::ledger::{
    AttemptStatus, Checkpoint, ControlLedger, ControlRecord, FileLocation, LedgerFilter,
    NewAttempt,
};
use crate::schema::{ColumnInfo, TableSchema};
use crate::store::{Cell, PlanColumn, RelationalStore};

pub const CONTROL_TABLE: &str = "file_processing_control";

/// Bind parameters Postgres accepts in one statement
const MAX_BIND_PARAMS: usize = u16::MAX as usize;

/// Rows one multi-row INSERT can carry without exceeding the bind limit
fn rows_per_statement(columns: usize) -> usize {
    (MAX_BIND_PARAMS / columns.max(1)).max(1)
}

const RECORD_COLUMNS: &str = "attempt_id, file_name, file_path, target_table, status, \
    total_rows, loaded_rows, current_batch, error_message, file_location, located_path, \
    superseded_by, created_at, modified_at, created_by, modified_by";

pub async fn create_pool(config: &DatabaseConfig) -> IngestResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .connect(&config.url)
        .await?;

    info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

pub async fn health_check(pool: &PgPool) -> IngestResult<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(IngestError::from)
}

/// Apply the embedded control-table migrations
pub async fn run_migrations(pool: &PgPool) -> IngestResult<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    info!("Database migrations applied");
    Ok(())
}

/// Quote a possibly schema-qualified identifier
pub fn quote_qualified(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

fn split_table(table: &str) -> (Option<&str>, &str) {
    match table.split_once('.') {
        Some((schema, name)) => (Some(schema), name),
        None => (None, table),
    }
}

fn record_from_row(row: &PgRow) -> IngestResult<ControlRecord> {
    Ok(ControlRecord {
        attempt_id: row.try_get("attempt_id")?,
        file_name: row.try_get("file_name")?,
        file_path: row.try_get("file_path")?,
        target_table: row.try_get("target_table")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        total_rows: row.try_get("total_rows")?,
        loaded_rows: row.try_get("loaded_rows")?,
        current_batch: row.try_get("current_batch")?,
        error_message: row.try_get("error_message")?,
        file_location: row.try_get::<String, _>("file_location")?.parse()?,
        located_path: row.try_get("located_path")?,
        superseded_by: row.try_get("superseded_by")?,
        created_at: row.try_get("created_at")?,
        modified_at: row.try_get("modified_at")?,
        created_by: row.try_get("created_by")?,
        modified_by: row.try_get("modified_by")?,
    })
}

/// Guarded checkpoint update, usable on the pool or inside a transaction
async fn advance_checkpoint<'e, E>(
    executor: E,
    attempt_id: Uuid,
    checkpoint: Checkpoint,
    operator: &str,
) -> IngestResult<()>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE file_processing_control
        SET current_batch = $2, loaded_rows = $3, modified_at = NOW(), modified_by = $4
        WHERE attempt_id = $1
          AND status = 'IN_PROGRESS'
          AND COALESCE(current_batch, 0) <= $2
          AND (total_rows IS NULL OR $3 <= total_rows)
        "#,
    )
    .bind(attempt_id)
    .bind(checkpoint.current_batch)
    .bind(checkpoint.loaded_rows)
    .bind(operator)
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(IngestError::CheckpointRejected {
            attempt_id,
            reason: format!(
                "batch {} / {} rows does not follow the committed checkpoint, \
                 or the attempt is not in progress",
                checkpoint.current_batch, checkpoint.loaded_rows
            ),
        });
    }
    Ok(())
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    operator: String,
}

impl PgStore {
    pub fn new(pool: PgPool, operator: impl Into<String>) -> Self {
        Self {
            pool,
            operator: operator.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Explain why a guarded status update matched no row
    async fn transition_failed(&self, attempt_id: Uuid, to: AttemptStatus) -> IngestError {
        match self.get(attempt_id).await {
            Ok(record) => IngestError::InvalidTransition {
                attempt_id,
                from: record.status,
                to,
            },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl RelationalStore for PgStore {
    async fn columns(&self, table: &str) -> IngestResult<TableSchema> {
        let (schema, name) = split_table(table);

        let rows = sqlx::query(
            r#"
            SELECT column_name::text AS column_name,
                   data_type::text AS data_type,
                   udt_schema::text AS udt_schema,
                   udt_name::text AS udt_name,
                   character_maximum_length::int4 AS max_length,
                   (is_nullable = 'YES') AS nullable,
                   column_default::text AS column_default
            FROM information_schema.columns
            WHERE table_schema = COALESCE($1, current_schema())
              AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(schema)
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(IngestError::TableNotFound(table.to_string()));
        }

        let columns = rows
            .iter()
            .map(|row| -> IngestResult<ColumnInfo> {
                let max_length: Option<i32> = row.try_get("max_length")?;
                let udt_schema: String = row.try_get("udt_schema")?;
                let udt_name: String = row.try_get("udt_name")?;
                let sql_type = if udt_schema == "pg_catalog" {
                    udt_name
                } else {
                    format!("{}.{}", udt_schema, udt_name)
                };

                let mut column = ColumnInfo::from_catalog(
                    row.try_get::<String, _>("column_name")?,
                    row.try_get::<String, _>("data_type")?,
                    max_length.and_then(|l| usize::try_from(l).ok()),
                    row.try_get("nullable")?,
                )
                .with_sql_type(sql_type);
                if let Some(default) = row.try_get::<Option<String>, _>("column_default")? {
                    column = column.with_default(default);
                }
                Ok(column)
            })
            .collect::<IngestResult<Vec<_>>>()?;

        debug!(table, columns = columns.len(), "Fetched live schema");
        Ok(TableSchema::new(table, columns))
    }

    async fn load_chunk(
        &self,
        table: &str,
        columns: &[PlanColumn],
        rows: &[Vec<Cell>],
        attempt_id: Uuid,
        checkpoint: Checkpoint,
    ) -> IngestResult<()> {
        let mut tx = self.pool.begin().await?;

        if columns.is_empty() {
            let statement = format!("INSERT INTO {} DEFAULT VALUES", quote_qualified(table));
            for _ in rows {
                sqlx::query(&statement).execute(&mut *tx).await?;
            }
        } else {
            let column_list = columns
                .iter()
                .map(|c| quote_qualified(&c.name))
                .collect::<Vec<_>>()
                .join(", ");

            for slice in rows.chunks(rows_per_statement(columns.len())) {
                let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                    "INSERT INTO {} ({}) ",
                    quote_qualified(table),
                    column_list
                ));

                builder.push_values(slice, |mut values, row| {
                    for (cell, column) in row.iter().zip(columns) {
                        match cell {
                            Cell::Default => {
                                values.push("DEFAULT");
                            },
                            Cell::Value(value) => {
                                values.push_bind(value.render());
                                if let Some(sql_type) = &column.sql_type {
                                    values.push_unseparated(format!(
                                        "::{}",
                                        quote_qualified(sql_type)
                                    ));
                                }
                            },
                        }
                    }
                });

                builder.build().execute(&mut *tx).await?;
            }
        }

        advance_checkpoint(&mut *tx, attempt_id, checkpoint, &self.operator).await?;
        tx.commit().await?;

        debug!(
            %attempt_id,
            table,
            batch = checkpoint.current_batch,
            loaded_rows = checkpoint.loaded_rows,
            "Chunk and checkpoint committed"
        );
        Ok(())
    }
}

#[async_trait]
impl ControlLedger for PgStore {
    async fn open(&self, attempt: &NewAttempt) -> IngestResult<Uuid> {
        let attempt_id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO file_processing_control
                (attempt_id, file_name, file_path, target_table, status,
                 loaded_rows, current_batch, file_location, located_path,
                 created_by, modified_by)
            VALUES ($1, $2, $3, $4, 'INITIATED', $5, $6, 'INPUT', $3, $7, $7)
            "#,
        )
        .bind(attempt_id)
        .bind(&attempt.file_name)
        .bind(&attempt.file_path)
        .bind(&attempt.target_table)
        .bind(attempt.resume.loaded_rows)
        .bind(attempt.resume.current_batch)
        .bind(&self.operator)
        .execute(&self.pool)
        .await?;

        self.begin(attempt_id).await?;
        Ok(attempt_id)
    }

    async fn begin(&self, attempt_id: Uuid) -> IngestResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE file_processing_control
            SET status = 'IN_PROGRESS', modified_at = NOW(), modified_by = $2
            WHERE attempt_id = $1 AND status = 'INITIATED'
            "#,
        )
        .bind(attempt_id)
        .bind(&self.operator)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .transition_failed(attempt_id, AttemptStatus::InProgress)
                .await);
        }
        Ok(())
    }

    async fn set_total_rows(&self, attempt_id: Uuid, total_rows: i64) -> IngestResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE file_processing_control
            SET total_rows = $2, modified_at = NOW(), modified_by = $3
            WHERE attempt_id = $1
              AND status IN ('INITIATED', 'IN_PROGRESS')
              AND (loaded_rows IS NULL OR loaded_rows <= $2)
            "#,
        )
        .bind(attempt_id)
        .bind(total_rows)
        .bind(&self.operator)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let record = self.get(attempt_id).await?;
            return Err(IngestError::CheckpointRejected {
                attempt_id,
                reason: format!(
                    "cannot set total rows {} on {} attempt with {} loaded rows",
                    total_rows,
                    record.status,
                    record.loaded_rows.unwrap_or(0)
                ),
            });
        }
        Ok(())
    }

    async fn advance(&self, attempt_id: Uuid, checkpoint: Checkpoint) -> IngestResult<()> {
        advance_checkpoint(&self.pool, attempt_id, checkpoint, &self.operator).await
    }

    async fn close_success(
        &self,
        attempt_id: Uuid,
        total_loaded: i64,
        located_path: &str,
    ) -> IngestResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE file_processing_control
            SET status = 'SUCCESS', loaded_rows = $2, file_location = 'ARCHIVE',
                located_path = $3, error_message = NULL,
                modified_at = NOW(), modified_by = $4
            WHERE attempt_id = $1 AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(attempt_id)
        .bind(total_loaded)
        .bind(located_path)
        .bind(&self.operator)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_failed(attempt_id, AttemptStatus::Success).await);
        }
        Ok(())
    }

    async fn close_error(
        &self,
        attempt_id: Uuid,
        message: &str,
        location: FileLocation,
        located_path: &str,
    ) -> IngestResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE file_processing_control
            SET status = 'ERROR', error_message = $2, file_location = $3,
                located_path = $4, modified_at = NOW(), modified_by = $5
            WHERE attempt_id = $1 AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(attempt_id)
        .bind(message)
        .bind(location.as_str())
        .bind(located_path)
        .bind(&self.operator)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_failed(attempt_id, AttemptStatus::Error).await);
        }
        Ok(())
    }

    async fn list_errors(&self) -> IngestResult<Vec<ControlRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE status = 'ERROR' AND superseded_by IS NULL \
             ORDER BY created_at",
            RECORD_COLUMNS, CONTROL_TABLE
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn get(&self, attempt_id: Uuid) -> IngestResult<ControlRecord> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE attempt_id = $1",
            RECORD_COLUMNS, CONTROL_TABLE
        ))
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(IngestError::AttemptNotFound(attempt_id))?;

        record_from_row(&row)
    }

    async fn list(&self, filter: &LedgerFilter) -> IngestResult<Vec<ControlRecord>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM {} WHERE TRUE",
            RECORD_COLUMNS, CONTROL_TABLE
        ));

        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(file_name) = &filter.file_name {
            builder.push(" AND file_name = ").push_bind(file_name);
        }
        builder.push(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit);
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn list_unfinished(&self, file_name: &str) -> IngestResult<Vec<ControlRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE file_name = $1 AND status <> 'SUCCESS' \
             AND superseded_by IS NULL ORDER BY created_at DESC",
            RECORD_COLUMNS, CONTROL_TABLE
        ))
        .bind(file_name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn supersede(&self, attempt_id: Uuid, successor: Uuid) -> IngestResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE file_processing_control
            SET superseded_by = $2, modified_at = NOW(), modified_by = $3
            WHERE attempt_id = $1
            "#,
        )
        .bind(attempt_id)
        .bind(successor)
        .bind(&self.operator)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IngestError::AttemptNotFound(attempt_id));
        }
        Ok(())
    }

    async fn mark_pending_retry(
        &self,
        attempt_id: Uuid,
        located_path: &str,
        reset_checkpoint: bool,
    ) -> IngestResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE file_processing_control
            SET status = 'PENDING_RETRY', file_location = 'INPUT', located_path = $2,
                current_batch = CASE WHEN $3 THEN 0 ELSE current_batch END,
                loaded_rows = CASE WHEN $3 THEN 0 ELSE loaded_rows END,
                modified_at = NOW(), modified_by = $4
            WHERE attempt_id = $1 AND status = 'ERROR'
            "#,
        )
        .bind(attempt_id)
        .bind(located_path)
        .bind(reset_checkpoint)
        .bind(&self.operator)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .transition_failed(attempt_id, AttemptStatus::PendingRetry)
                .await);
        }
        Ok(())
    }
}
