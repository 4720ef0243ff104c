//! Object catalog client: one bucket, browsed one folder level at a time.
//!
//! S3 has no folders. A listing with the `/` delimiter returns the keys at
//! one level plus the common prefixes below it, and those prefixes are what
//! the browser shows as folders.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, DEFAULT_PRESIGN_EXPIRY_SECS, MAX_PRESIGN_EXPIRY_SECS};
use crate::credentials::CredentialRecord;
use crate::error::CatalogError;
use crate::store::{
    DeleteFailure, ListPageRequest, ObjectStat, ObjectStore, S3Object, S3Store, StoreError,
    MAX_DELETE_BATCH,
};

pub const DELIMITER: &str = "/";
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
pub const FOLDER_CONTENT_TYPE: &str = "application/x-directory";

/// One level of the bucket hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingResult {
    pub objects: Vec<S3Object>,
    /// Common prefixes, each ending in `/`.
    pub folders: Vec<String>,
    pub is_truncated: bool,
    pub continuation_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub key: String,
    pub content: Vec<u8>,
    pub content_type: Option<String>,
}

impl UploadRequest {
    pub fn new(key: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            content,
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub key: String,
    pub etag: Option<String>,
    pub error: Option<String>,
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-file results of a batch upload, in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReport {
    pub outcomes: Vec<UploadOutcome>,
}

impl UploadReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(UploadOutcome::is_success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &UploadOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.is_success())
    }

    pub fn into_result(self) -> Result<Self, CatalogError> {
        let failed = self.failed().count();
        if failed > 0 {
            return Err(CatalogError::BatchUpload {
                failed,
                total: self.outcomes.len(),
            });
        }
        Ok(self)
    }
}

/// Result of a batch delete: every requested key lands in exactly one list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    pub failed: Vec<DeleteFailure>,
}

impl DeleteReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn into_result(self) -> Result<Self, CatalogError> {
        if !self.is_success() {
            return Err(CatalogError::BatchDelete {
                failed: self.failed.len(),
                total: self.deleted.len() + self.failed.len(),
            });
        }
        Ok(self)
    }
}

pub struct CatalogClient {
    store: Arc<dyn ObjectStore>,
    page_size: i32,
    upload_concurrency: usize,
}

impl std::fmt::Debug for CatalogClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogClient")
            .field("bucket", &self.store.bucket())
            .field("page_size", &self.page_size)
            .field("upload_concurrency", &self.upload_concurrency)
            .finish()
    }
}

impl CatalogClient {
    pub fn new(store: Arc<dyn ObjectStore>, config: &AppConfig) -> Self {
        Self {
            store,
            page_size: config.page_size,
            upload_concurrency: config.upload_concurrency.max(1),
        }
    }

    /// A client talking to S3 with the record's credentials.
    pub fn connect(record: &CredentialRecord, config: &AppConfig) -> Self {
        Self::new(Arc::new(S3Store::new(record, config)), config)
    }

    pub fn bucket(&self) -> &str {
        self.store.bucket()
    }

    /// Whether the bucket is reachable with the current credentials.
    pub async fn test_connection(&self) -> bool {
        match self.store.head_bucket().await {
            Ok(()) => true,
            Err(err) => {
                warn!(bucket = %self.bucket(), "Connection test failed: {err}");
                false
            }
        }
    }

    /// List one level below `prefix` (empty for the bucket root).
    ///
    /// At most one page is returned; pass the result's continuation token back
    /// in to fetch the next one. Entries keep the order the service returned.
    pub async fn list_objects(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
    ) -> Result<ListingResult, CatalogError> {
        if prefix.starts_with(DELIMITER) {
            return Err(CatalogError::InvalidPrefix(prefix.to_string()));
        }

        let request = ListPageRequest {
            prefix: prefix.to_string(),
            delimiter: Some(DELIMITER.to_string()),
            continuation_token: continuation_token.map(str::to_string),
            max_keys: self.page_size,
        };
        let page = self
            .store
            .list_page(&request)
            .await
            .map_err(|err| CatalogError::Listing(err.to_string()))?;

        let mut folders = Vec::with_capacity(page.common_prefixes.len());
        let mut seen = HashSet::new();
        for folder in page.common_prefixes {
            if folder != prefix && seen.insert(folder.clone()) {
                folders.push(folder);
            }
        }

        // Drop the folder's own marker object and anything that should have
        // been grouped under a common prefix. A prefix without a trailing
        // delimiter is not a folder, so an object named exactly like it stays.
        let is_folder = prefix.ends_with(DELIMITER);
        let objects = page
            .contents
            .into_iter()
            .filter(|object| {
                !(is_folder && object.key == prefix)
                    && !seen.contains(&object.key)
                    && object
                        .key
                        .strip_prefix(prefix)
                        .is_some_and(|rest| !rest.contains(DELIMITER))
            })
            .collect();

        let continuation_token = if page.is_truncated {
            page.next_continuation_token
        } else {
            None
        };

        Ok(ListingResult {
            objects,
            folders,
            is_truncated: continuation_token.is_some(),
            continuation_token,
        })
    }

    /// Every entry at one level, following continuation tokens to the end.
    pub async fn list_all_objects(&self, prefix: &str) -> Result<ListingResult, CatalogError> {
        let mut result = ListingResult::default();
        let mut seen_keys = HashSet::new();
        let mut seen_folders = HashSet::new();
        let mut token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = self.list_objects(prefix, token.as_deref()).await?;
            pages += 1;

            for object in page.objects {
                if seen_keys.insert(object.key.clone()) {
                    result.objects.push(object);
                }
            }
            for folder in page.folders {
                if seen_folders.insert(folder.clone()) {
                    result.folders.push(folder);
                }
            }

            match page.continuation_token {
                Some(next) if token.as_deref() != Some(next.as_str()) => token = Some(next),
                _ => break,
            }
        }

        debug!(
            prefix,
            pages,
            objects = result.objects.len(),
            folders = result.folders.len(),
            "Listed full level"
        );
        Ok(result)
    }

    /// Single PUT of `content` to `key`, replacing any existing object.
    /// Returns the new ETag.
    pub async fn upload_file(
        &self,
        content: Vec<u8>,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<String, CatalogError> {
        ensure_key(key)?;
        let content_type = content_type
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE);
        let size = content.len();

        let etag = self
            .store
            .put_object(key, content, content_type)
            .await
            .map_err(|err| CatalogError::Upload {
                key: key.to_string(),
                message: err.to_string(),
            })?;

        debug!(key, size, "Uploaded object");
        Ok(etag)
    }

    /// Upload several files concurrently. Every upload runs to completion;
    /// failures are reported per file in the returned report.
    pub async fn upload_files(&self, requests: Vec<UploadRequest>) -> UploadReport {
        let total = requests.len();
        let outcomes: Vec<UploadOutcome> = stream::iter(requests)
            .map(|request| async move {
                let UploadRequest {
                    key,
                    content,
                    content_type,
                } = request;
                match self.upload_file(content, &key, content_type.as_deref()).await {
                    Ok(etag) => UploadOutcome {
                        key,
                        etag: Some(etag),
                        error: None,
                    },
                    Err(err) => {
                        warn!("{err}");
                        UploadOutcome {
                            key,
                            etag: None,
                            error: Some(err.to_string()),
                        }
                    }
                }
            })
            .buffered(self.upload_concurrency)
            .collect()
            .await;

        let report = UploadReport { outcomes };
        info!(
            total,
            failed = report.failed().count(),
            "Finished batch upload"
        );
        report
    }

    /// A pre-signed GET URL for `key`, valid for `expires_in` (default one hour).
    /// The key is not checked for existence.
    pub async fn get_download_url(
        &self,
        key: &str,
        expires_in: Option<Duration>,
    ) -> Result<String, CatalogError> {
        ensure_key(key)?;
        let expires_in = expires_in.unwrap_or(Duration::from_secs(DEFAULT_PRESIGN_EXPIRY_SECS));
        let seconds = expires_in.as_secs();
        if seconds == 0 || seconds > MAX_PRESIGN_EXPIRY_SECS {
            return Err(CatalogError::InvalidExpiry {
                got: seconds,
                max: MAX_PRESIGN_EXPIRY_SECS,
            });
        }

        self.store
            .presign_get(key, expires_in)
            .await
            .map_err(|err| CatalogError::Presign {
                key: key.to_string(),
                message: err.to_string(),
            })
    }

    /// Delete `key`. Succeeds if it does not exist.
    pub async fn delete_object(&self, key: &str) -> Result<(), CatalogError> {
        ensure_key(key)?;
        self.store
            .delete_object(key)
            .await
            .map_err(|err| CatalogError::Delete {
                key: key.to_string(),
                message: err.to_string(),
            })?;
        debug!(key, "Deleted object");
        Ok(())
    }

    /// Delete `keys` with batch requests of up to [`MAX_DELETE_BATCH`] keys.
    /// Every batch is sent even when an earlier one fails; the report says
    /// which keys were deleted and which were not.
    pub async fn delete_objects(&self, keys: &[String]) -> DeleteReport {
        let mut report = DeleteReport::default();
        let mut valid = Vec::with_capacity(keys.len());
        for key in keys {
            match ensure_key(key) {
                Ok(()) => valid.push(key.clone()),
                Err(err) => report.failed.push(DeleteFailure {
                    key: key.clone(),
                    message: err.to_string(),
                }),
            }
        }

        for chunk in valid.chunks(MAX_DELETE_BATCH) {
            let failed = match self.store.delete_objects(chunk).await {
                Ok(failed) => failed,
                Err(err) => {
                    warn!(bucket = %self.bucket(), keys = chunk.len(), "Batch delete failed: {err}");
                    chunk
                        .iter()
                        .map(|key| DeleteFailure {
                            key: key.clone(),
                            message: err.to_string(),
                        })
                        .collect()
                }
            };
            let failed_keys: HashSet<&str> = failed.iter().map(|failure| failure.key.as_str()).collect();
            report.deleted.extend(
                chunk
                    .iter()
                    .filter(|key| !failed_keys.contains(key.as_str()))
                    .cloned(),
            );
            report.failed.extend(failed);
        }

        info!(
            total = keys.len(),
            failed = report.failed.len(),
            "Finished batch delete"
        );
        report
    }

    /// Server-side copy within the bucket. The source must exist.
    pub async fn copy_object(
        &self,
        source_key: &str,
        destination_key: &str,
    ) -> Result<(), CatalogError> {
        ensure_key(source_key)?;
        ensure_key(destination_key)?;

        self.store
            .copy_object(source_key, destination_key)
            .await
            .map_err(|err| CatalogError::Copy {
                source_key: source_key.to_string(),
                destination_key: destination_key.to_string(),
                message: match err {
                    StoreError::NotFound(message) => format!("source does not exist ({message})"),
                    StoreError::Transport(message) => message,
                },
            })?;
        debug!(source_key, destination_key, "Copied object");
        Ok(())
    }

    /// Copy to the new key, then delete the old one.
    pub async fn rename_object(
        &self,
        source_key: &str,
        destination_key: &str,
    ) -> Result<(), CatalogError> {
        if source_key == destination_key {
            return Ok(());
        }
        self.copy_object(source_key, destination_key).await?;
        self.delete_object(source_key).await
    }

    pub async fn stat_object(&self, key: &str) -> Result<ObjectStat, CatalogError> {
        ensure_key(key)?;
        self.store
            .head_object(key)
            .await
            .map_err(|err| CatalogError::Stat {
                key: key.to_string(),
                message: err.to_string(),
            })
    }

    /// Write a zero-length marker at `path/` so an empty folder shows up in
    /// its parent's listing. Harmless if objects already exist below it.
    pub async fn create_folder(&self, path: &str) -> Result<(), CatalogError> {
        let key = normalize_prefix(path);
        if key.is_empty() || key.starts_with(DELIMITER) {
            return Err(CatalogError::InvalidKey(path.to_string()));
        }

        self.store
            .put_object(&key, Vec::new(), FOLDER_CONTENT_TYPE)
            .await
            .map_err(|err| CatalogError::Upload {
                key: key.clone(),
                message: err.to_string(),
            })?;
        debug!(%key, "Created folder marker");
        Ok(())
    }
}

/// Append the delimiter unless `prefix` is empty or already ends with it.
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() {
        String::new()
    } else if prefix.ends_with(DELIMITER) {
        prefix.to_string()
    } else {
        format!("{prefix}{DELIMITER}")
    }
}

fn ensure_key(key: &str) -> Result<(), CatalogError> {
    if key.is_empty() {
        return Err(CatalogError::InvalidKey("key must not be empty".to_string()));
    }
    Ok(())
}
