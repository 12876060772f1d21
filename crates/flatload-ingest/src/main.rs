//! flatload - flat file ingestion tool

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flatload_common::logging::{init_logging, LogConfig, LogLevel};
use flatload_ingest::config::IngestConfig;
use flatload_ingest::ledger::{AttemptStatus, ControlLedger, LedgerFilter};
use flatload_ingest::postgres::{self, PgStore};
use flatload_ingest::storage::{self, StorageLayout};
use flatload_ingest::{PipelineCoordinator, RetryCoordinator};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "flatload")]
#[command(author, version, about = "Load flat files into relational tables")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (defaults to $FLATLOAD_CONFIG or ./flatload.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover and load input files for every configured pattern
    Run {
        /// Requeue failed files before discovery
        #[arg(long)]
        retry_first: bool,
    },

    /// Move failed files back to the input area
    Retry {
        /// Reset committed progress so the next attempt starts over
        #[arg(long)]
        from_scratch: bool,
    },

    /// Show control records
    Status {
        /// Only records with this status
        #[arg(long, value_parser = parse_status)]
        status: Option<AttemptStatus>,

        /// Only records for this file name
        #[arg(long)]
        file: Option<String>,

        /// Maximum number of records
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Load and validate configuration without touching storage or database
    CheckConfig,
}

fn parse_status(s: &str) -> Result<AttemptStatus, String> {
    s.parse::<AttemptStatus>().map_err(|e| e.to_string())
}

/// Database-backed collaborators
struct Services {
    store: Arc<PgStore>,
    storage: Arc<dyn storage::FileStorage>,
    layout: StorageLayout,
}

async fn connect(config: &IngestConfig) -> Result<Services> {
    let pool = postgres::create_pool(&config.database)
        .await
        .context("Failed to connect to database")?;
    postgres::health_check(&pool).await?;

    if config.database.run_migrations {
        postgres::run_migrations(&pool)
            .await
            .context("Failed to apply migrations")?;
    }

    Ok(Services {
        store: Arc::new(PgStore::new(pool, &config.pipeline.operator)),
        storage: storage::from_config(&config.storage).await?,
        layout: StorageLayout::from_config(&config.storage),
    })
}

async fn retry(services: &Services, resume: bool) -> Result<()> {
    let summary = RetryCoordinator::new(
        services.storage.clone(),
        services.layout.clone(),
        services.store.clone(),
    )
    .retry(resume)
    .await?;

    println!(
        "Retry: {} requeued, {} skipped, {} failed (resume from checkpoint: {})",
        summary.requeued, summary.skipped, summary.failed, resume
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("flatload")
        .build()
        .with_env_overrides()?;

    let _guard = init_logging(&log_config)?;

    let config = IngestConfig::load(cli.config.as_deref()).context("Invalid configuration")?;

    match cli.command {
        Command::CheckConfig => {
            let catalog = config.catalog()?;
            println!("Configuration OK: {} pattern(s)", catalog.len());
            for pattern in catalog.iter() {
                println!(
                    "  {:<20} {} -> {} ({} columns)",
                    pattern.name,
                    pattern.file_regex.as_str(),
                    pattern.target_table,
                    pattern.column_mappings.len()
                );
            }
        },
        Command::Retry { from_scratch } => {
            let services = connect(&config).await?;
            let resume = !from_scratch && config.pipeline.resume_from_checkpoint;
            retry(&services, resume).await?;
        },
        Command::Run { retry_first } => {
            let services = connect(&config).await?;

            if retry_first || config.pipeline.retry_before_run {
                retry(&services, config.pipeline.resume_from_checkpoint).await?;
            }

            let coordinator = PipelineCoordinator::new(
                config.catalog()?,
                services.storage.clone(),
                services.layout.clone(),
                services.store.clone(),
                services.store.clone(),
            )
            .with_chunk_size(config.pipeline.chunk_size);

            let summary = coordinator.run().await?;
            for pattern in &summary.patterns {
                println!(
                    "{:<20} discovered {:>4}  loaded {:>4}  failed {:>4}",
                    pattern.pattern, pattern.discovered, pattern.succeeded, pattern.failed
                );
            }

            if summary.failed() > 0 {
                info!(failed = summary.failed(), "Run finished with failed files");
                return Ok(ExitCode::from(2));
            }
        },
        Command::Status {
            status,
            file,
            limit,
        } => {
            let services = connect(&config).await?;
            let records = services
                .store
                .list(&LedgerFilter {
                    status,
                    file_name: file,
                    limit: Some(limit),
                })
                .await?;

            for record in records {
                println!(
                    "{}  {:<13} {:<7} batch {:>4}  rows {:>6}/{:<6} {}  {}",
                    record.attempt_id,
                    record.status.as_str(),
                    record.file_location.as_str(),
                    record.current_batch.unwrap_or(0),
                    record.loaded_rows.unwrap_or(0),
                    record
                        .total_rows
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    record.file_name,
                    record.error_message.as_deref().unwrap_or("")
                );
            }
        },
    }

    Ok(ExitCode::SUCCESS)
}
