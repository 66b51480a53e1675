//! In-memory doubles for the remote store and the index, used by unit tests.

use crate::{
    models::{
        account::{Account, AccountType},
        canary_config::{CanaryConfigSummary, IndexAction},
    },
    services::{
        backend::{
            BackendError, BackendResult, BucketInfo, ListObjectsRequest, ObjectListing,
            ObjectSummary, RemoteObjectStore,
        },
        canary_index::{
            CanaryConfigIndex, IndexError, IndexResult, applications_overlap,
        },
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashMap},
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
};

pub fn account_with(root_folder: &str, client: Arc<dyn RemoteObjectStore>) -> Account {
    Account {
        name: "acct".to_string(),
        supported_types: vec![AccountType::ObjectStore],
        bucket: "bucket".to_string(),
        region: "local".to_string(),
        root_folder: root_folder.to_string(),
        client,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListingOrder {
    Ascending,
    Descending,
}

#[derive(Clone)]
struct Blob {
    body: Bytes,
    last_modified: DateTime<Utc>,
}

struct MemoryState {
    buckets: HashMap<String, BTreeMap<String, Blob>>,
    order: ListingOrder,
    failing_puts: u32,
    failing_deletes: u32,
    bucket_info_error: bool,
    puts: Vec<String>,
    deletes: Vec<String>,
    list_calls: usize,
}

pub struct MemoryObjectStore {
    state: Mutex<MemoryState>,
}

impl MemoryObjectStore {
    pub const KIND: &'static str = "memory";

    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                buckets: HashMap::new(),
                order: ListingOrder::Ascending,
                failing_puts: 0,
                failing_deletes: 0,
                bucket_info_error: false,
                puts: Vec::new(),
                deletes: Vec::new(),
                list_calls: 0,
            }),
        }
    }

    pub fn with_bucket(bucket: &str) -> Self {
        let store = Self::new();
        store.lock().buckets.insert(bucket.to_string(), BTreeMap::new());
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    pub fn insert(&self, bucket: &str, key: &str, body: &str) {
        self.insert_at(bucket, key, body, Utc::now());
    }

    pub fn insert_at(&self, bucket: &str, key: &str, body: &str, last_modified: DateTime<Utc>) {
        self.lock().buckets.entry(bucket.to_string()).or_default().insert(
            key.to_string(),
            Blob {
                body: Bytes::from(body.to_string()),
                last_modified,
            },
        );
    }

    pub fn set_listing_order(&self, order: ListingOrder) {
        self.lock().order = order;
    }

    pub fn fail_next_puts(&self, count: u32) {
        self.lock().failing_puts = count;
    }

    pub fn fail_next_deletes(&self, count: u32) {
        self.lock().failing_deletes = count;
    }

    pub fn fail_bucket_info(&self, fail: bool) {
        self.lock().bucket_info_error = fail;
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.lock().buckets.contains_key(bucket)
    }

    pub fn put_attempts(&self) -> Vec<String> {
        self.lock().puts.clone()
    }

    pub fn delete_attempts(&self) -> Vec<String> {
        self.lock().deletes.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }
}

fn injected(what: &str) -> BackendError {
    BackendError::Io(io::Error::new(io::ErrorKind::Other, format!("injected {} failure", what)))
}

#[async_trait]
impl RemoteObjectStore for MemoryObjectStore {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    async fn get_object(&self, bucket: &str, key: &str) -> BackendResult<Bytes> {
        let state = self.lock();
        let objects = state
            .buckets
            .get(bucket)
            .ok_or_else(|| BackendError::NoSuchBucket(bucket.to_string()))?;
        objects
            .get(key)
            .map(|blob| blob.body.clone())
            .ok_or_else(|| BackendError::NoSuchKey {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        _content_md5: &str,
    ) -> BackendResult<()> {
        let mut state = self.lock();
        state.puts.push(key.to_string());
        if state.failing_puts > 0 {
            state.failing_puts -= 1;
            return Err(injected("put"));
        }
        let objects = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| BackendError::NoSuchBucket(bucket.to_string()))?;
        objects.insert(
            key.to_string(),
            Blob {
                body,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> BackendResult<()> {
        let mut state = self.lock();
        state.deletes.push(key.to_string());
        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            return Err(injected("delete"));
        }
        if let Some(objects) = state.buckets.get_mut(bucket) {
            objects.remove(key);
        }
        Ok(())
    }

    async fn list_objects(&self, request: &ListObjectsRequest) -> BackendResult<ObjectListing> {
        let mut state = self.lock();
        state.list_calls += 1;
        let objects = state
            .buckets
            .get(&request.bucket)
            .ok_or_else(|| BackendError::NoSuchBucket(request.bucket.clone()))?;

        let mut matching: Vec<ObjectSummary> = objects
            .iter()
            .filter(|(key, _)| key.starts_with(&request.prefix))
            .map(|(key, blob)| ObjectSummary {
                key: key.clone(),
                size: blob.body.len() as u64,
                last_modified: blob.last_modified,
            })
            .collect();
        if state.order == ListingOrder::Descending {
            matching.reverse();
        }
        if let Some(marker) = &request.marker {
            if let Some(pos) = matching.iter().position(|s| &s.key == marker) {
                matching.drain(..=pos);
            }
        }

        let is_truncated = matching.len() > request.max_keys;
        matching.truncate(request.max_keys);
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
        let state = self.lock();
        if state.bucket_info_error {
            return Err(injected("bucket info"));
        }
        if state.buckets.contains_key(bucket) {
            Ok(BucketInfo {
                name: bucket.to_string(),
                created_at: None,
            })
        } else {
            Err(BackendError::NoSuchBucket(bucket.to_string()))
        }
    }

    async fn create_bucket(&self, bucket: &str) -> BackendResult<()> {
        let mut state = self.lock();
        if state.buckets.contains_key(bucket) {
            return Err(BackendError::BucketAlreadyExists(bucket.to_string()));
        }
        state.buckets.insert(bucket.to_string(), BTreeMap::new());
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexCall {
    CurrentTimestamp,
    Start {
        action: IndexAction,
        correlation_id: String,
        summary: CanaryConfigSummary,
    },
    Finish {
        action: IndexAction,
        correlation_id: String,
    },
    Remove {
        action: IndexAction,
        correlation_id: String,
    },
    IdFromName {
        name: String,
    },
    SummaryFromId {
        id: String,
    },
    SummarySet,
}

#[derive(Default)]
struct IndexState {
    calls: Vec<IndexCall>,
    summaries: BTreeMap<(String, String), CanaryConfigSummary>,
    pending: HashMap<String, (IndexAction, CanaryConfigSummary)>,
}

/// Index double that keeps summaries in memory and records every call.
pub struct RecordingIndex {
    state: Mutex<IndexState>,
    clock: AtomicI64,
    finish_fails: AtomicBool,
    remove_fails: AtomicBool,
}

impl Default for RecordingIndex {
    fn default() -> Self {
        Self {
            state: Mutex::new(IndexState::default()),
            clock: AtomicI64::new(1_700_000_000_000),
            finish_fails: AtomicBool::new(false),
            remove_fails: AtomicBool::new(false),
        }
    }
}

impl RecordingIndex {
    fn lock(&self) -> std::sync::MutexGuard<'_, IndexState> {
        self.state.lock().unwrap()
    }

    fn record(&self, call: IndexCall) {
        self.lock().calls.push(call);
    }

    pub fn fail_finish(&self, fail: bool) {
        self.finish_fails.store(fail, Ordering::SeqCst);
    }

    pub fn fail_remove(&self, fail: bool) {
        self.remove_fails.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<IndexCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn starts(&self) -> Vec<(IndexAction, String, CanaryConfigSummary)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                IndexCall::Start {
                    action,
                    correlation_id,
                    summary,
                } => Some((action, correlation_id, summary)),
                _ => None,
            })
            .collect()
    }

    pub fn finishes_for(&self, id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, IndexCall::Finish { correlation_id, .. } if correlation_id == id))
            .count()
    }

    pub fn removals_for(&self, id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, IndexCall::Remove { correlation_id, .. } if correlation_id == id))
            .count()
    }

    pub fn finish_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, IndexCall::Finish { .. }))
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Seed a durable summary without going through the protocol.
    pub fn seed(&self, account: &str, summary: CanaryConfigSummary) {
        self.lock()
            .summaries
            .insert((account.to_string(), summary.id.clone()), summary);
    }
}

#[async_trait]
impl CanaryConfigIndex for RecordingIndex {
    async fn current_timestamp(&self) -> IndexResult<i64> {
        self.record(IndexCall::CurrentTimestamp);
        Ok(self.clock.fetch_add(1, Ordering::SeqCst))
    }

    async fn start_pending_update(
        &self,
        _account: &str,
        _timestamp: i64,
        action: IndexAction,
        correlation_id: &str,
        summary_json: &str,
    ) -> IndexResult<()> {
        let summary: CanaryConfigSummary =
            serde_json::from_str(summary_json).map_err(|source| IndexError::MalformedSummary {
                subject: correlation_id.to_string(),
                source,
            })?;
        self.record(IndexCall::Start {
            action,
            correlation_id: correlation_id.to_string(),
            summary: summary.clone(),
        });
        self.lock()
            .pending
            .insert(correlation_id.to_string(), (action, summary));
        Ok(())
    }

    async fn finish_pending_update(
        &self,
        account: &str,
        action: IndexAction,
        correlation_id: &str,
    ) -> IndexResult<()> {
        self.record(IndexCall::Finish {
            action,
            correlation_id: correlation_id.to_string(),
        });
        if self.finish_fails.load(Ordering::SeqCst) {
            return Err(IndexError::Unavailable("injected finish failure".into()));
        }
        let mut state = self.lock();
        if let Some((action, summary)) = state.pending.remove(correlation_id) {
            let key = (account.to_string(), summary.id.clone());
            match action {
                IndexAction::Update => {
                    state.summaries.insert(key, summary);
                }
                IndexAction::Delete => {
                    state.summaries.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn remove_failed_pending_update(
        &self,
        _account: &str,
        _timestamp: i64,
        action: IndexAction,
        correlation_id: &str,
        _summary_json: &str,
    ) -> IndexResult<()> {
        self.record(IndexCall::Remove {
            action,
            correlation_id: correlation_id.to_string(),
        });
        if self.remove_fails.load(Ordering::SeqCst) {
            return Err(IndexError::Unavailable("injected remove failure".into()));
        }
        self.lock().pending.remove(correlation_id);
        Ok(())
    }

    async fn id_from_name(
        &self,
        account: &str,
        name: &str,
        applications: &[String],
        candidate_id: &str,
    ) -> IndexResult<Option<String>> {
        self.record(IndexCall::IdFromName {
            name: name.to_string(),
        });
        Ok(self
            .lock()
            .summaries
            .iter()
            .filter(|((acct, id), s)| acct == account && id != candidate_id && s.name == name)
            .find(|(_, s)| applications_overlap(&s.applications, applications))
            .map(|(_, s)| s.id.clone()))
    }

    async fn summary_from_id(
        &self,
        account: &str,
        id: &str,
    ) -> IndexResult<Option<CanaryConfigSummary>> {
        self.record(IndexCall::SummaryFromId { id: id.to_string() });
        Ok(self
            .lock()
            .summaries
            .get(&(account.to_string(), id.to_string()))
            .cloned())
    }

    async fn summary_set(
        &self,
        account: &str,
        applications: &[String],
    ) -> IndexResult<Vec<CanaryConfigSummary>> {
        self.record(IndexCall::SummarySet);
        Ok(self
            .lock()
            .summaries
            .iter()
            .filter(|((acct, _), s)| {
                acct == account && applications_overlap(&s.applications, applications)
            })
            .map(|(_, s)| s.clone())
            .collect())
    }
}
