//! In-process object store.
//!
//! Implements the same delimiter and continuation-token semantics as S3 so
//! the catalog can be exercised without a network. Contents are lost on drop.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

use super::{
    DeleteFailure, ListPage, ListPageRequest, ObjectStat, ObjectStore, S3Object, StoreError,
};

const STORAGE_CLASS: &str = "STANDARD";

#[derive(Debug, Clone)]
struct StoredObject {
    body: Vec<u8>,
    content_type: String,
    etag: String,
    last_modified: DateTime<Utc>,
}

enum LevelEntry<'a> {
    Object(&'a str, &'a StoredObject),
    Prefix(String),
}

impl LevelEntry<'_> {
    fn name(&self) -> &str {
        match self {
            LevelEntry::Object(key, _) => key,
            LevelEntry::Prefix(prefix) => prefix,
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    bucket: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    failing_keys: RwLock<HashSet<String>>,
    unreachable: AtomicBool,
    list_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Default::default()
        }
    }

    /// Make every PUT or DELETE of `key` fail.
    pub fn fail_writes_for(&self, key: impl Into<String>) {
        self.failing_keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into());
    }

    /// Simulate the service being unreachable for every call.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of listing calls served so far.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|object| object.content_type.clone())
    }

    fn is_failing(&self, key: &str) -> bool {
        self.failing_keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Transport("Connection refused".to_string()));
        }
        Ok(())
    }

    fn to_s3_object(key: &str, object: &StoredObject) -> S3Object {
        S3Object {
            key: key.to_string(),
            size: object.body.len() as u64,
            last_modified: object.last_modified,
            etag: object.etag.clone(),
            storage_class: Some(STORAGE_CLASS.to_string()),
        }
    }
}

fn content_etag(body: &[u8]) -> String {
    Sha256::digest(body)
        .iter()
        .take(16)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn decode_token(token: &str) -> Result<String, StoreError> {
    URL_SAFE_NO_PAD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| StoreError::Transport("The continuation token provided is incorrect".to_string()))
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn head_bucket(&self) -> Result<(), StoreError> {
        self.check_reachable()
    }

    async fn list_page(&self, request: &ListPageRequest) -> Result<ListPage, StoreError> {
        self.check_reachable()?;
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let start_after = request
            .continuation_token
            .as_deref()
            .map(decode_token)
            .transpose()?;
        let max_keys = request.max_keys.max(1) as usize;
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);

        // Keys sharing a prefix are contiguous in sorted order, so grouped
        // prefixes only need comparing against the last entry pushed.
        let mut level: Vec<LevelEntry<'_>> = Vec::new();
        for (key, object) in objects.range(request.prefix.clone()..) {
            let Some(rest) = key.strip_prefix(request.prefix.as_str()) else {
                break;
            };

            let grouped = request.delimiter.as_deref().and_then(|delimiter| {
                rest.find(delimiter).map(|idx| {
                    format!("{}{}", request.prefix, &rest[..idx + delimiter.len()])
                })
            });

            match grouped {
                Some(prefix) => {
                    if level.last().map(LevelEntry::name) != Some(prefix.as_str()) {
                        level.push(LevelEntry::Prefix(prefix));
                    }
                }
                None => level.push(LevelEntry::Object(key.as_str(), object)),
            }
        }

        let remaining: Vec<LevelEntry<'_>> = level
            .into_iter()
            .filter(|entry| {
                start_after
                    .as_deref()
                    .map_or(true, |after| entry.name() > after)
            })
            .collect();

        let is_truncated = remaining.len() > max_keys;
        let mut page = ListPage {
            is_truncated,
            ..Default::default()
        };
        let mut last_name = None;
        for entry in remaining.into_iter().take(max_keys) {
            last_name = Some(entry.name().to_string());
            match entry {
                LevelEntry::Object(key, object) => page.contents.push(Self::to_s3_object(key, object)),
                LevelEntry::Prefix(prefix) => page.common_prefixes.push(prefix),
            }
        }
        if is_truncated {
            page.next_continuation_token = last_name.map(|name| URL_SAFE_NO_PAD.encode(name));
        }

        Ok(page)
    }

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StoreError> {
        self.check_reachable()?;
        if self.is_failing(key) {
            return Err(StoreError::Transport(format!("Simulated upload failure for {key}")));
        }

        let etag = content_etag(&body);
        let object = StoredObject {
            body,
            content_type: content_type.to_string(),
            etag: etag.clone(),
            last_modified: Utc::now(),
        };
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), object);
        Ok(etag)
    }

    async fn head_object(&self, key: &str) -> Result<ObjectStat, StoreError> {
        self.check_reachable()?;
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        let object = objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(format!("NotFound: {key}")))?;

        Ok(ObjectStat {
            key: key.to_string(),
            size: object.body.len() as u64,
            last_modified: object.last_modified,
            etag: object.etag.clone(),
            content_type: object.content_type.clone(),
        })
    }

    async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        self.check_reachable()?;
        if self.is_failing(key) {
            return Err(StoreError::Transport(format!("Simulated delete failure for {key}")));
        }
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    async fn delete_objects(&self, keys: &[String]) -> Result<Vec<DeleteFailure>, StoreError> {
        self.check_reachable()?;
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let mut failures = Vec::new();
        for key in keys {
            if self.is_failing(key) {
                failures.push(DeleteFailure {
                    key: key.clone(),
                    message: "AccessDenied: Simulated delete failure".to_string(),
                });
            } else {
                objects.remove(key);
            }
        }
        Ok(failures)
    }

    async fn copy_object(
        &self,
        source_key: &str,
        destination_key: &str,
    ) -> Result<(), StoreError> {
        self.check_reachable()?;
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let mut copy = objects
            .get(source_key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("NoSuchKey: {source_key}")))?;
        copy.last_modified = Utc::now();
        objects.insert(destination_key.to_string(), copy);
        Ok(())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StoreError> {
        let base = format!("memory://{}/", self.bucket);
        let mut url = Url::parse(&base)
            .and_then(|base| base.join(key))
            .map_err(|err| StoreError::Transport(format!("Invalid object key {key}: {err}")))?;
        url.query_pairs_mut()
            .append_pair("issued", &Utc::now().timestamp_nanos_opt().unwrap_or_default().to_string())
            .append_pair("expires", &expires_in.as_secs().to_string());
        Ok(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prefix: &str, token: Option<String>, max_keys: i32) -> ListPageRequest {
        ListPageRequest {
            prefix: prefix.to_string(),
            delimiter: Some("/".to_string()),
            continuation_token: token,
            max_keys,
        }
    }

    async fn seeded(keys: &[&str]) -> MemoryStore {
        let store = MemoryStore::new("test-bucket");
        for key in keys {
            store.put_object(key, b"x".to_vec(), "text/plain").await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_delimiter_groups_prefixes() {
        let store = seeded(&["a/1.txt", "a/b/2.txt", "a/b/3.txt", "a/c/4.txt", "a/d.txt", "z.txt"]).await;

        let page = store.list_page(&request("a/", None, 1000)).await.unwrap();
        let keys: Vec<_> = page.contents.iter().map(|o| o.key.as_str()).collect();

        assert_eq!(keys, vec!["a/1.txt", "a/d.txt"]);
        assert_eq!(page.common_prefixes, vec!["a/b/", "a/c/"]);
        assert!(!page.is_truncated);
        assert!(page.next_continuation_token.is_none());
    }

    #[tokio::test]
    async fn test_without_delimiter_lists_everything() {
        let store = seeded(&["a/1.txt", "a/b/2.txt"]).await;
        let mut req = request("a/", None, 1000);
        req.delimiter = None;

        let page = store.list_page(&req).await.unwrap();
        assert_eq!(page.contents.len(), 2);
        assert!(page.common_prefixes.is_empty());
    }

    #[tokio::test]
    async fn test_pages_follow_token() {
        let store = seeded(&["k/1", "k/2", "k/3", "k/4", "k/5/x"]).await;

        let first = store.list_page(&request("k/", None, 2)).await.unwrap();
        assert!(first.is_truncated);
        assert_eq!(first.contents.len(), 2);

        let second = store
            .list_page(&request("k/", first.next_continuation_token.clone(), 2))
            .await
            .unwrap();
        let third = store
            .list_page(&request("k/", second.next_continuation_token.clone(), 2))
            .await
            .unwrap();

        assert_eq!(second.contents.len(), 2);
        assert!(second.is_truncated);
        assert_eq!(third.common_prefixes, vec!["k/5/"]);
        assert!(!third.is_truncated);
        assert_eq!(store.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_bad_token_rejected() {
        let store = seeded(&["a"]).await;
        let result = store
            .list_page(&request("", Some("!!not-base64!!".to_string()), 10))
            .await;
        assert!(matches!(result, Err(StoreError::Transport(_))));
    }

    #[tokio::test]
    async fn test_batch_delete_reports_refused_keys() {
        let store = seeded(&["a", "b", "c"]).await;
        store.fail_writes_for("b");

        let failures = store
            .delete_objects(&["a".to_string(), "b".to_string(), "missing".to_string()])
            .await
            .unwrap();

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].key, "b");
        assert_eq!(store.keys(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_copy_missing_source_not_found() {
        let store = MemoryStore::new("b");
        let result = store.copy_object("missing", "dest").await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unreachable_store_fails() {
        let store = MemoryStore::new("b");
        store.set_unreachable(true);
        assert!(store.head_bucket().await.is_err());
    }
}
