//! S3-compatible object storage backend
//!
//! Locations are key prefixes inside one bucket. A relocation is a copy
//! followed by a delete of the source key.

use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::Client;
use regex::Regex;
use tracing::{debug, info, instrument};

use super::{file_name, FileStorage};
use crate::config::S3Config;
use crate::error::{IngestError, IngestResult};

#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    pub async fn new(config: &S3Config) -> IngestResult<Self> {
        debug!(bucket = %config.bucket, endpoint = ?config.endpoint, "Initializing S3 storage");

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                loader = loader.credentials_provider(Credentials::new(
                    access_key,
                    secret_key,
                    None,
                    None,
                    "flatload-storage",
                ));
            },
            (None, None) => {},
            _ => {
                return Err(IngestError::config(
                    "storage.s3 access_key and secret_key must be set together",
                ))
            },
        }

        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let shared = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.path_style)
            .build();

        info!(bucket = %config.bucket, "S3 storage client initialized");

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), String> {
        let copy_source = format!("{}/{}", self.bucket, from);

        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(&copy_source)
            .key(to)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| format!("copy failed: {}", e))
    }

    async fn delete(&self, key: &str) -> Result<(), String> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| format!("delete of source failed: {}", e))
    }
}

fn prefix_of(location: &str) -> String {
    let trimmed = location.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

#[async_trait]
impl FileStorage for S3Storage {
    #[instrument(skip(self, pattern))]
    async fn list(&self, location: &str, pattern: &Regex) -> IngestResult<Vec<String>> {
        let prefix = prefix_of(location);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| {
                    IngestError::storage(format!(
                        "cannot list s3://{}/{}: {}",
                        self.bucket, prefix, e
                    ))
                })?;

            for key in response.contents().iter().filter_map(|o| o.key()) {
                let Some(name) = key.strip_prefix(&prefix) else {
                    continue;
                };
                // Only direct children of the location
                if !name.is_empty() && !name.contains('/') && pattern.is_match(name) {
                    keys.push(key.to_string());
                }
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                },
                _ => break,
            }
        }

        keys.sort();
        debug!(prefix = %prefix, matched = keys.len(), "Listed input objects");
        Ok(keys)
    }

    #[instrument(skip(self))]
    async fn fetch(&self, path: &str) -> IngestResult<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    IngestError::FileNotFound(path.to_string())
                } else {
                    IngestError::Read {
                        path: path.to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| IngestError::Read {
                path: path.to_string(),
                reason: e.to_string(),
            })?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), self.bucket, path);
        Ok(data)
    }

    async fn exists(&self, path: &str) -> IngestResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(IngestError::storage(format!(
                "Failed to check S3 object existence: {}",
                e
            ))),
        }
    }

    #[instrument(skip(self))]
    async fn relocate(&self, from: &str, to: &str) -> IngestResult<()> {
        if !self.exists(from).await? {
            if self.exists(to).await? {
                debug!(from, to, "Object already relocated");
                return Ok(());
            }
            return Err(IngestError::FileNotFound(from.to_string()));
        }

        let failed = |reason: String| IngestError::RelocationFailed {
            from: from.to_string(),
            to: to.to_string(),
            reason,
        };

        self.copy(from, to).await.map_err(failed)?;
        self.delete(from).await.map_err(failed)?;

        info!(
            file = file_name(from),
            "Relocated s3://{}/{} to s3://{}/{}", self.bucket, from, self.bucket, to
        );
        Ok(())
    }
}
