//! Local filesystem backend

use async_trait::async_trait;
use regex::Regex;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, info, instrument, warn};

use super::{file_name, join, FileStorage};
use crate::error::{IngestError, IngestResult};

#[derive(Debug, Clone, Default)]
pub struct LocalStorage;

impl LocalStorage {
    pub fn new() -> Self {
        Self
    }
}

fn relocation_failed(from: &str, to: &str, reason: impl ToString) -> IngestError {
    IngestError::RelocationFailed {
        from: from.to_string(),
        to: to.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl FileStorage for LocalStorage {
    #[instrument(skip(self, pattern))]
    async fn list(&self, location: &str, pattern: &Regex) -> IngestResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(location).await.map_err(|e| {
            IngestError::storage(format!("cannot list '{}': {}", location, e))
        })?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| IngestError::storage(format!("cannot list '{}': {}", location, e)))?
        {
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_file && pattern.is_match(&name) {
                paths.push(join(location, &name));
            }
        }

        paths.sort();
        debug!(location, matched = paths.len(), "Listed input files");
        Ok(paths)
    }

    async fn fetch(&self, path: &str) -> IngestResult<Vec<u8>> {
        tokio::fs::read(path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => IngestError::FileNotFound(path.to_string()),
            _ => IngestError::Read {
                path: path.to_string(),
                reason: e.to_string(),
            },
        })
    }

    async fn exists(&self, path: &str) -> IngestResult<bool> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| IngestError::storage(format!("cannot stat '{}': {}", path, e)))
    }

    #[instrument(skip(self))]
    async fn relocate(&self, from: &str, to: &str) -> IngestResult<()> {
        if !self.exists(from).await? {
            if self.exists(to).await? {
                debug!(from, to, "File already relocated");
                return Ok(());
            }
            return Err(IngestError::FileNotFound(from.to_string()));
        }

        if let Some(parent) = Path::new(to).parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| relocation_failed(from, to, e))?;
        }

        if let Err(rename_err) = tokio::fs::rename(from, to).await {
            // Rename cannot cross filesystems; fall back to copy and remove
            warn!(from, to, error = %rename_err, "Rename failed, copying instead");
            tokio::fs::copy(from, to)
                .await
                .map_err(|e| relocation_failed(from, to, e))?;
            tokio::fs::remove_file(from)
                .await
                .map_err(|e| relocation_failed(from, to, e))?;
        }

        info!(file = file_name(from), to, "File relocated");
        Ok(())
    }
}
