//! File storage
//!
//! The pipeline only sees [`FileStorage`]: list the input area, read a file
//! into raw rows, and relocate a file. Relocation failures surface as
//! `RelocationFailed`, distinct from `FileNotFound`.

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use std::sync::Arc;

use crate::catalog::ReadOptions;
use crate::config::{StorageBackend, StorageConfig};
use crate::error::{IngestError, IngestResult};
use crate::record::RawRow;

pub mod local;
pub mod reader;
pub mod s3;

pub use local::LocalStorage;
pub use s3::S3Storage;

#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Paths directly under `location` whose file name matches `pattern`,
    /// sorted
    async fn list(&self, location: &str, pattern: &Regex) -> IngestResult<Vec<String>>;

    /// Raw file contents
    async fn fetch(&self, path: &str) -> IngestResult<Vec<u8>>;

    async fn exists(&self, path: &str) -> IngestResult<bool>;

    /// Move `from` to `to`
    ///
    /// When `from` is gone but `to` exists the move already happened and this
    /// succeeds. When neither exists it fails with `FileNotFound`.
    async fn relocate(&self, from: &str, to: &str) -> IngestResult<()>;

    /// Read and decode a file into raw rows
    async fn read(
        &self,
        path: &str,
        format: &str,
        options: &ReadOptions,
    ) -> IngestResult<Vec<RawRow>> {
        let bytes = self.fetch(path).await?;
        reader::decode(&bytes, format, options, path)
    }
}

/// Last path segment
pub fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Join a location and a file name with `/`
pub fn join(location: &str, name: &str) -> String {
    let base = location.trim_end_matches('/');
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", base, name)
    }
}

/// Name of a relocated file: `{YYYYMMDD}_{file_name}`
pub fn stamped_name(file_name: &str, date: NaiveDate) -> String {
    format!("{}_{}", date.format("%Y%m%d"), file_name)
}

/// The three storage areas
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    pub input: String,
    pub archive: String,
    pub error: String,
}

impl StorageLayout {
    pub fn new(
        input: impl Into<String>,
        archive: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            input: input.into(),
            archive: archive.into(),
            error: error.into(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.input, &config.archive, &config.error)
    }

    pub fn input_path(&self, file_name: &str) -> String {
        join(&self.input, file_name)
    }

    pub fn archive_path(&self, file_name: &str, date: NaiveDate) -> String {
        join(&self.archive, &stamped_name(file_name, date))
    }

    pub fn error_path(&self, file_name: &str, date: NaiveDate) -> String {
        join(&self.error, &stamped_name(file_name, date))
    }
}

/// Build the configured backend
pub async fn from_config(config: &StorageConfig) -> IngestResult<Arc<dyn FileStorage>> {
    match config.backend {
        StorageBackend::Local => Ok(Arc::new(LocalStorage::new())),
        StorageBackend::S3 => {
            let s3 = config.s3.as_ref().ok_or_else(|| {
                IngestError::config("S3 backend selected but storage.s3 is not configured")
            })?;
            Ok(Arc::new(S3Storage::new(s3).await?))
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = StorageLayout::new("/data/in/", "/data/archive", "s3-error");
        let date = NaiveDate::from_ymd_opt(2024, 7, 4).unwrap();

        assert_eq!(layout.input_path("a.csv"), "/data/in/a.csv");
        assert_eq!(layout.archive_path("a.csv", date), "/data/archive/20240704_a.csv");
        assert_eq!(layout.error_path("a.csv", date), "s3-error/20240704_a.csv");
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("/data/in/a.csv"), "a.csv");
        assert_eq!(file_name("incoming/orders.csv"), "orders.csv");
        assert_eq!(file_name("plain.csv"), "plain.csv");
    }

    #[test]
    fn test_join_with_empty_prefix() {
        assert_eq!(join("", "a.csv"), "a.csv");
    }
}
