//! The remote object-store interface the storage service is written against.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("bucket `{0}` does not exist")]
    NoSuchBucket(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("key `{key}` does not exist in bucket `{bucket}`")]
    NoSuchKey { bucket: String, key: String },
    #[error("content digest mismatch for `{key}`: expected {expected}, computed {actual}")]
    InvalidDigest {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Clone, Debug)]
pub struct ListObjectsRequest {
    pub bucket: String,
    pub prefix: String,
    /// Only keys strictly greater than the marker are returned.
    pub marker: Option<String>,
    pub max_keys: usize,
}

impl ListObjectsRequest {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>, max_keys: usize) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into(),
            marker: None,
            max_keys,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct ObjectListing {
    pub summaries: Vec<ObjectSummary>,
    pub is_truncated: bool,
    pub next_marker: Option<String>,
}

#[derive(Clone, Debug)]
pub struct BucketInfo {
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Minimal S3/OSS-like client surface.
///
/// Keys are `/`-separated paths within a bucket. Listing returns keys in
/// ascending order, at most `max_keys` per page.
#[async_trait]
pub trait RemoteObjectStore: Send + Sync {
    /// Short tag identifying the backend implementation.
    fn kind(&self) -> &'static str;

    async fn get_object(&self, bucket: &str, key: &str) -> BackendResult<Bytes>;

    /// Write `body`, overwriting any existing object. `content_md5` is the
    /// base64-encoded MD5 digest of `body`.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_md5: &str,
    ) -> BackendResult<()>;

    /// Deleting a missing key succeeds.
    async fn delete_object(&self, bucket: &str, key: &str) -> BackendResult<()>;

    async fn list_objects(&self, request: &ListObjectsRequest) -> BackendResult<ObjectListing>;

    async fn bucket_info(&self, bucket: &str) -> BackendResult<BucketInfo>;

    async fn create_bucket(&self, bucket: &str) -> BackendResult<()>;
}
