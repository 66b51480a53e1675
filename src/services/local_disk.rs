//! src/services/local_disk.rs
//!
//! LocalDiskObjectStore: a `RemoteObjectStore` that keeps each bucket as a
//! directory beneath `base_path` and each object as a file at
//! `base_path/{bucket}/{key}`. Writes go to a temp file first and are renamed
//! into place so readers never observe a half-written object.

use crate::services::backend::{
    BackendError, BackendResult, BucketInfo, ListObjectsRequest, ObjectListing, ObjectSummary,
    RemoteObjectStore,
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const TMP_PREFIX: &str = ".tmp-";

#[derive(Clone, Debug)]
pub struct LocalDiskObjectStore {
    /// Base directory on disk where buckets are created.
    base_path: PathBuf,
}

impl LocalDiskObjectStore {
    pub const KIND: &'static str = "local-disk";

    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Reject keys that would escape the bucket directory or that have no
    /// one-to-one file path (empty segments).
    fn ensure_key_safe(key: &str) -> BackendResult<()> {
        let invalid = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key
                .split('/')
                .any(|segment| segment.is_empty() || segment == "..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if invalid {
            return Err(BackendError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    /// Bucket names: 3–63 chars of lowercase letters, digits, dots and
    /// hyphens, starting and ending alphanumeric.
    fn ensure_bucket_name_safe(name: &str) -> BackendResult<()> {
        let len_ok = (BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&name.len());
        let chars_ok = name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'));
        let edges_ok = name
            .chars()
            .next()
            .zip(name.chars().last())
            .is_some_and(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric());
        if len_ok && chars_ok && edges_ok && !name.contains("..") {
            Ok(())
        } else {
            Err(BackendError::InvalidKey(name.to_string()))
        }
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.base_path.join(bucket)
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        let mut path = self.bucket_root(bucket);
        for segment in key.split('/') {
            path.push(segment);
        }
        path
    }

    async fn require_bucket(&self, bucket: &str) -> BackendResult<PathBuf> {
        let root = self.bucket_root(bucket);
        match fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => Ok(root),
            Ok(_) => Err(BackendError::NoSuchBucket(bucket.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(BackendError::NoSuchBucket(bucket.to_string()))
            }
            Err(err) => Err(BackendError::Io(err)),
        }
    }

    /// Collect every object file below `dir`, keyed relative to `root`.
    fn walk<'a>(
        root: &'a Path,
        dir: PathBuf,
        out: &'a mut Vec<ObjectSummary>,
    ) -> BoxFuture<'a, io::Result<()>> {
        async move {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    Self::walk(root, path, out).await?;
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with(TMP_PREFIX) {
                    continue;
                }
                let Ok(relative) = path.strip_prefix(root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let meta = entry.metadata().await?;
                let last_modified = meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                out.push(ObjectSummary {
                    key,
                    size: meta.len(),
                    last_modified,
                });
            }
            Ok(())
        }
        .boxed()
    }

    /// Remove empty directories from `start` up to, but not including, `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl RemoteObjectStore for LocalDiskObjectStore {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    async fn get_object(&self, bucket: &str, key: &str) -> BackendResult<Bytes> {
        Self::ensure_key_safe(key)?;
        self.require_bucket(bucket).await?;
        match fs::read(self.object_path(bucket, key)).await {
            Ok(body) => Ok(Bytes::from(body)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(BackendError::NoSuchKey {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Err(err) => Err(BackendError::Io(err)),
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_md5: &str,
    ) -> BackendResult<()> {
        Self::ensure_key_safe(key)?;
        self.require_bucket(bucket).await?;

        let actual = general_purpose::STANDARD.encode(md5::compute(&body).0);
        if actual != content_md5 {
            return Err(BackendError::InvalidDigest {
                key: key.to_string(),
                expected: content_md5.to_string(),
                actual,
            });
        }

        let file_path = self.object_path(bucket, key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            BackendError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));

        let written = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(&body).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &file_path).await
        }
        .await;

        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::Io(err));
        }

        debug!("wrote {} bytes to {}", body.len(), file_path.display());
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> BackendResult<()> {
        Self::ensure_key_safe(key)?;
        let bucket_root = self.require_bucket(bucket).await?;
        let file_path = self.object_path(bucket, key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(BackendError::Io(err)),
        }
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &bucket_root).await;
        }
        Ok(())
    }

    async fn list_objects(&self, request: &ListObjectsRequest) -> BackendResult<ObjectListing> {
        let root = self.require_bucket(&request.bucket).await?;
        let mut all = Vec::new();
        Self::walk(&root, root.clone(), &mut all).await?;

        let mut matching: Vec<ObjectSummary> = all
            .into_iter()
            .filter(|s| s.key.starts_with(&request.prefix))
            .filter(|s| request.marker.as_ref().is_none_or(|m| s.key.as_str() > m.as_str()))
            .collect();
        matching.sort_by(|a, b| a.key.cmp(&b.key));

        let max_keys = request.max_keys.max(1);
        let is_truncated = matching.len() > max_keys;
        matching.truncate(max_keys);
        let next_marker = if is_truncated {
            matching.last().map(|s| s.key.clone())
        } else {
            None
        };

        Ok(ObjectListing {
            summaries: matching,
            is_truncated,
            next_marker,
        })
    }

    async fn bucket_info(&self, bucket: &str) -> BackendResult<BucketInfo> {
        let root = self.require_bucket(bucket).await?;
        let created_at = fs::metadata(&root)
            .await?
            .created()
            .ok()
            .map(DateTime::<Utc>::from);
        Ok(BucketInfo {
            name: bucket.to_string(),
            created_at,
        })
    }

    async fn create_bucket(&self, bucket: &str) -> BackendResult<()> {
        Self::ensure_bucket_name_safe(bucket)?;
        let root = self.bucket_root(bucket);
        if fs::metadata(&root).await.is_ok() {
            return Err(BackendError::BucketAlreadyExists(bucket.to_string()));
        }
        fs::create_dir_all(&root).await?;
        debug!("created bucket directory {}", root.display());
        Ok(())
    }
}
