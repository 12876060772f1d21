//! Configuration management
//!
//! Layers, lowest first: built-in defaults, the TOML/YAML file named by
//! `FLATLOAD_CONFIG` (default `flatload.toml`), then `FLATLOAD__`-prefixed
//! environment variables with `__` between keys. `DATABASE_URL` always wins
//! for the connection string.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::catalog::{FilePatternConfig, SchemaCatalog};
use crate::error::{IngestError, IngestResult};
use crate::loader::DEFAULT_CHUNK_SIZE;

// ============================================================================
// Defaults
// ============================================================================

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "flatload.toml";

/// Environment variable naming the configuration file.
pub const CONFIG_FILE_ENV: &str = "FLATLOAD_CONFIG";

/// Prefix for environment overrides, e.g. `FLATLOAD__PIPELINE__CHUNK_SIZE`.
pub const ENV_PREFIX: &str = "FLATLOAD";

pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/flatload";
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

pub const DEFAULT_OPERATOR: &str = "SYSTEM";

/// Whole ingestion configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    /// Named file patterns; the schema catalog is compiled from these
    pub patterns: BTreeMap<String, FilePatternConfig>,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    /// Apply embedded migrations for the control table on startup
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            run_migrations: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Local,
    S3,
}

/// File storage configuration
///
/// `input`, `archive` and `error` are directories for the local backend and
/// key prefixes for S3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub input: String,
    pub archive: String,
    pub error: String,
    pub s3: Option<S3Config>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            input: "data/input".to_string(),
            archive: "data/archive".to_string(),
            error: "data/error".to_string(),
            s3: None,
        }
    }
}

/// S3-compatible object storage
///
/// Without explicit keys the default AWS credential chain is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub endpoint: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    pub bucket: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    #[serde(default)]
    pub path_style: bool,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl S3Config {
    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: default_region(),
            bucket: bucket.into(),
            access_key: Some("minioadmin".to_string()),
            secret_key: Some("minioadmin".to_string()),
            path_style: true,
        }
    }
}

/// Pipeline behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Rows per chunk transaction
    pub chunk_size: usize,
    /// Recorded as `created_by`/`modified_by` on control records
    pub operator: String,
    /// Requeue failed files before every `run`
    pub retry_before_run: bool,
    /// Keep committed progress when requeuing
    pub resume_from_checkpoint: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            operator: DEFAULT_OPERATOR.to_string(),
            retry_before_run: false,
            resume_from_checkpoint: true,
        }
    }
}

impl IngestConfig {
    /// Load configuration from `path`, `FLATLOAD_CONFIG` or `flatload.toml`
    ///
    /// An explicitly named file must exist; the default one is optional.
    pub fn load(path: Option<&Path>) -> IngestResult<Self> {
        dotenvy::dotenv().ok();

        let (file, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match std::env::var(CONFIG_FILE_ENV) {
                Ok(p) => (PathBuf::from(p), true),
                Err(_) => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
            },
        };

        let settings = config::Config::builder()
            .add_source(config::File::from(file.as_path()).required(required))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("database.url", std::env::var("DATABASE_URL").ok())
            .and_then(|builder| builder.build())
            .map_err(|e| IngestError::config(e.to_string()))?;

        let config: IngestConfig = settings
            .try_deserialize()
            .map_err(|e| IngestError::config(e.to_string()))?;

        config.validate()?;

        tracing::debug!(
            file = %file.display(),
            patterns = config.patterns.len(),
            backend = ?config.storage.backend,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> IngestResult<()> {
        if self.database.url.is_empty() {
            return Err(IngestError::config("Database URL cannot be empty"));
        }

        if self.database.max_connections == 0 {
            return Err(IngestError::config(
                "Database max_connections must be greater than 0",
            ));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(IngestError::config(format!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }

        if self.pipeline.chunk_size == 0 {
            return Err(IngestError::config("Pipeline chunk_size must be greater than 0"));
        }

        for (name, dir) in [
            ("input", &self.storage.input),
            ("archive", &self.storage.archive),
            ("error", &self.storage.error),
        ] {
            if dir.trim().is_empty() {
                return Err(IngestError::config(format!(
                    "Storage {} location cannot be empty",
                    name
                )));
            }
        }

        if self.storage.backend == StorageBackend::S3 {
            match &self.storage.s3 {
                Some(s3) if !s3.bucket.is_empty() => {},
                _ => {
                    return Err(IngestError::config(
                        "S3 backend selected but storage.s3.bucket is not set",
                    ))
                },
            }
        }

        let catalog = self.catalog()?;
        if catalog.is_empty() {
            tracing::warn!("No file patterns configured - nothing will be ingested");
        }

        Ok(())
    }

    /// Compile the schema catalog
    pub fn catalog(&self) -> IngestResult<SchemaCatalog> {
        SchemaCatalog::from_config(&self.patterns)
    }
}
