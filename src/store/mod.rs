//! The remote object store contract the catalog client is written against.

mod memory;
mod s3;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

pub use memory::MemoryStore;
pub use s3::S3Store;

/// Most keys a single DeleteObjects request accepts.
pub const MAX_DELETE_BATCH: usize = 1000;

/// An object as reported by a listing call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Object {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub etag: String,
    pub storage_class: Option<String>,
}

/// Object metadata returned by a HEAD request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStat {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub etag: String,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPageRequest {
    pub prefix: String,
    pub delimiter: Option<String>,
    pub continuation_token: Option<String>,
    pub max_keys: i32,
}

/// One page of a ListObjectsV2 response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub contents: Vec<S3Object>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
}

/// A key the service refused to delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteFailure {
    pub key: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Transport(String),
}

/// A single bucket on an S3-compatible service.
///
/// Implementations own their retry and timeout policy; callers never retry.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Succeeds if the bucket exists and the credentials can reach it.
    async fn head_bucket(&self) -> Result<(), StoreError>;

    async fn list_page(&self, request: &ListPageRequest) -> Result<ListPage, StoreError>;

    /// Single-shot PUT. Returns the ETag without surrounding quotes.
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StoreError>;

    async fn head_object(&self, key: &str) -> Result<ObjectStat, StoreError>;

    /// Deleting a missing key succeeds.
    async fn delete_object(&self, key: &str) -> Result<(), StoreError>;

    /// Delete up to [`MAX_DELETE_BATCH`] keys in one request. Returns the keys
    /// the service reported as failed; missing keys are not failures.
    async fn delete_objects(&self, keys: &[String]) -> Result<Vec<DeleteFailure>, StoreError>;

    /// Server-side copy within the bucket.
    async fn copy_object(&self, source_key: &str, destination_key: &str)
        -> Result<(), StoreError>;

    /// A time-limited GET URL. Does not check that the key exists.
    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StoreError>;
}

pub(crate) fn trim_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}
