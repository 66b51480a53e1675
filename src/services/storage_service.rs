//! src/services/storage_service.rs
//!
//! ObjectStoreStorageService: load/store/delete/list of typed JSON objects in
//! a remote object store, with canary-config mutations mirrored into the
//! summary index through pending updates. Puts and deletes are retried with a
//! fixed backoff; reads and listings are not.

use crate::{
    models::{
        account::{Account, AccountType},
        canary_config::{CanaryConfig, CanaryConfigSummary, IndexAction, ObjectListEntry, iso_millis},
        object_type::ObjectType,
    },
    services::{
        accounts::AccountRegistry,
        backend::{BackendError, BucketInfo, ListObjectsRequest, ObjectSummary},
        canary_index::{CanaryConfigIndex, IndexError, PendingIndexUpdate},
        paths::{build_path, resolve_singular_path, typed_folder},
        retry::RetryPolicy,
    },
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use std::{collections::BTreeSet, sync::Arc};
use thiserror::Error;
use tracing::{debug, error, info};

/// Page size for full listings of a type's folder.
pub const MAX_KEYS: usize = 1000;

/// Why a put or delete (and the index bookkeeping around it) failed.
#[derive(Debug, Error)]
pub enum WriteFailure {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unable to resolve account `{0}`")]
    AccountNotFound(String),
    #[error("unable to resolve singular {object_type} at `{path}`")]
    ObjectNotFound {
        object_type: ObjectType,
        path: String,
    },
    #[error("unable to deserialize object (key: {key}): {reason}")]
    Deserialization { key: String, reason: String },
    #[error("problem serializing object (key: {key}): {reason}")]
    Serialization { key: String, reason: String },
    #[error(
        "canary config with name '{name}' already exists in the scope of applications {applications:?}"
    )]
    NameConflict {
        name: String,
        applications: Vec<String>,
        existing_id: String,
    },
    #[error("write to `{path}` failed: {source}")]
    StorageWriteFailure {
        path: String,
        #[source]
        source: WriteFailure,
    },
    #[error("unable to provision bucket `{bucket}`: {source}")]
    ContainerProvisioningFailure {
        bucket: String,
        #[source]
        source: BackendError,
    },
    #[error("index lookup for `{key}` failed: {source}")]
    Index {
        key: String,
        #[source]
        source: IndexError,
    },
    #[error("storage task for `{key}` did not complete: {reason}")]
    TaskFailed { key: String, reason: String },
    #[error("listing `{path}` in bucket `{bucket}` failed: {source}")]
    Backend {
        bucket: String,
        path: String,
        #[source]
        source: BackendError,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A storage backend able to hold typed objects for a set of accounts.
#[async_trait]
pub trait StorageService: Send + Sync {
    fn services_account(&self, account_name: &str) -> bool;

    async fn load_object<T>(
        &self,
        account_name: &str,
        object_type: ObjectType,
        object_key: &str,
    ) -> StorageResult<T>
    where
        T: DeserializeOwned + Send;

    /// Write `obj` under `object_key`. `is_update` marks a replacement of an
    /// existing object, whose old path is removed if the filename changed.
    async fn store_object<T>(
        &self,
        account_name: &str,
        object_type: ObjectType,
        object_key: &str,
        obj: &T,
        filename: Option<&str>,
        is_update: bool,
    ) -> StorageResult<()>
    where
        T: Serialize + Sync;

    async fn delete_object(
        &self,
        account_name: &str,
        object_type: ObjectType,
        object_key: &str,
    ) -> StorageResult<()>;

    /// Summaries of every object of `object_type`. Canary configs come from
    /// the index unless `skip_index` is set.
    async fn list_object_keys(
        &self,
        account_name: &str,
        object_type: ObjectType,
        applications: &[String],
        skip_index: bool,
    ) -> StorageResult<Vec<ObjectListEntry>>;
}

/// `StorageService` over any `RemoteObjectStore` backend kind.
///
/// Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct ObjectStoreStorageService {
    registry: Arc<AccountRegistry>,
    account_names: Arc<BTreeSet<String>>,
    index: Arc<dyn CanaryConfigIndex>,
    retry: RetryPolicy,
}

impl ObjectStoreStorageService {
    /// Serve every registered account that supports `OBJECT_STORE` and whose
    /// client is of `backend_kind`. The set is fixed at construction.
    pub fn from_registry(
        registry: Arc<AccountRegistry>,
        backend_kind: &str,
        index: Arc<dyn CanaryConfigIndex>,
        retry: RetryPolicy,
    ) -> Self {
        let account_names: BTreeSet<String> = registry
            .all()
            .into_iter()
            .filter(|account| account.supports(AccountType::ObjectStore))
            .filter(|account| account.client.kind() == backend_kind)
            .map(|account| account.name.clone())
            .collect();

        info!(
            "Populated storage service with {} {} accounts.",
            account_names.len(),
            backend_kind
        );

        Self {
            registry,
            account_names: Arc::new(account_names),
            index,
            retry,
        }
    }

    pub fn account_names(&self) -> impl Iterator<Item = &str> {
        self.account_names.iter().map(String::as_str)
    }

    pub fn index(&self) -> &Arc<dyn CanaryConfigIndex> {
        &self.index
    }

    fn account(&self, account_name: &str) -> StorageResult<Arc<Account>> {
        if !self.services_account(account_name) {
            return Err(StorageError::AccountNotFound(account_name.to_string()));
        }
        self.registry
            .resolve(account_name)
            .ok_or_else(|| StorageError::AccountNotFound(account_name.to_string()))
    }

    /// Bucket info for a serviced account, used by readiness checks.
    pub async fn check_account(&self, account_name: &str) -> StorageResult<BucketInfo> {
        let account = self.account(account_name)?;
        account
            .client
            .bucket_info(&account.bucket)
            .await
            .map_err(|source| StorageError::ContainerProvisioningFailure {
                bucket: account.bucket.clone(),
                source,
            })
    }

    /// Make sure a serviced account's bucket exists, creating it if needed.
    pub async fn provision_account(&self, account_name: &str) -> StorageResult<()> {
        let account = self.account(account_name)?;
        self.ensure_bucket_exists(&account).await
    }

    /// [`StorageService::store_object`] on its own task. The write and its
    /// pending update run to commit or rollback even if the caller stops
    /// waiting.
    pub async fn store_object_detached<T>(
        &self,
        account_name: String,
        object_type: ObjectType,
        object_key: String,
        obj: T,
        filename: Option<String>,
        is_update: bool,
    ) -> StorageResult<()>
    where
        T: Serialize + Send + Sync + 'static,
    {
        let service = self.clone();
        let key = object_key.clone();
        let task = tokio::spawn(async move {
            service
                .store_object(
                    &account_name,
                    object_type,
                    &object_key,
                    &obj,
                    filename.as_deref(),
                    is_update,
                )
                .await
        });
        task.await.map_err(|err| StorageError::TaskFailed {
            key,
            reason: err.to_string(),
        })?
    }

    /// [`StorageService::delete_object`] on its own task.
    pub async fn delete_object_detached(
        &self,
        account_name: String,
        object_type: ObjectType,
        object_key: String,
    ) -> StorageResult<()> {
        let service = self.clone();
        let key = object_key.clone();
        let task = tokio::spawn(async move {
            service
                .delete_object(&account_name, object_type, &object_key)
                .await
        });
        task.await.map_err(|err| StorageError::TaskFailed {
            key,
            reason: err.to_string(),
        })?
    }

    /// Create the account's bucket when the store reports it missing.
    async fn ensure_bucket_exists(&self, account: &Account) -> StorageResult<()> {
        let provisioning = |source| StorageError::ContainerProvisioningFailure {
            bucket: account.bucket.clone(),
            source,
        };
        match account.client.bucket_info(&account.bucket).await {
            Ok(_) => Ok(()),
            Err(BackendError::NoSuchBucket(_)) => {
                match account.client.create_bucket(&account.bucket).await {
                    Ok(()) => {
                        info!("Created bucket {} for account {}", account.bucket, account.name);
                        Ok(())
                    }
                    Err(BackendError::BucketAlreadyExists(_)) => Ok(()),
                    Err(source) => Err(provisioning(source)),
                }
            }
            Err(source) => Err(provisioning(source)),
        }
    }

    async fn check_for_duplicate_canary_config(
        &self,
        account: &Account,
        config: &CanaryConfig,
        canary_config_id: &str,
    ) -> StorageResult<()> {
        let existing = self
            .index
            .id_from_name(
                &account.name,
                &config.name,
                &config.applications,
                canary_config_id,
            )
            .await
            .map_err(|source| StorageError::Index {
                key: canary_config_id.to_string(),
                source,
            })?;

        match existing {
            Some(existing_id) if !existing_id.is_empty() => {
                Err(StorageError::NameConflict {
                    name: config.name.clone(),
                    applications: config.applications.clone(),
                    existing_id,
                })
            }
            _ => Ok(()),
        }
    }

    async fn current_timestamp(&self, key: &str) -> StorageResult<i64> {
        self.index
            .current_timestamp()
            .await
            .map_err(|source| StorageError::Index {
                key: key.to_string(),
                source,
            })
    }

    async fn start_pending(
        &self,
        account: &Account,
        action: IndexAction,
        summary: CanaryConfigSummary,
    ) -> StorageResult<PendingIndexUpdate> {
        let key = summary.id.clone();
        PendingIndexUpdate::start(self.index.clone(), &account.name, action, summary)
            .await
            .map_err(|source| StorageError::Index { key, source })
    }

    /// Put `body` at `path`, drop the object's previous path if it moved, then
    /// finish the pending update.
    async fn put_and_finish(
        &self,
        account: &Account,
        path: &str,
        body: Bytes,
        original_path: Option<&str>,
        pending: Option<&mut PendingIndexUpdate>,
    ) -> Result<(), WriteFailure> {
        let client = &account.client;
        let bucket = account.bucket.as_str();
        let content_md5 = general_purpose::STANDARD.encode(md5::compute(&body).0);
        let content_md5 = content_md5.as_str();

        self.retry
            .retry(|| client.put_object(bucket, path, body.clone(), content_md5))
            .await?;

        // Set only when a canary config was renamed.
        if let Some(original_path) = original_path.filter(|original| *original != path) {
            debug!("removing renamed object at {}", original_path);
            self.retry
                .retry(|| client.delete_object(bucket, original_path))
                .await?;
        }

        if let Some(pending) = pending {
            pending.commit().await?;
        }
        Ok(())
    }

    async fn delete_and_finish(
        &self,
        account: &Account,
        path: &str,
        pending: Option<&mut PendingIndexUpdate>,
    ) -> Result<(), WriteFailure> {
        let client = &account.client;
        let bucket = account.bucket.as_str();
        self.retry
            .retry(|| client.delete_object(bucket, path))
            .await?;

        if let Some(pending) = pending {
            pending.commit().await?;
        }
        Ok(())
    }

    /// Turn raw listing entries below `prefix` into list entries. Entries
    /// that sit directly in the folder, without a key segment, are skipped.
    fn to_list_entries(
        object_type: ObjectType,
        prefix: &str,
        summaries: Vec<ObjectSummary>,
    ) -> Vec<ObjectListEntry> {
        summaries
            .into_iter()
            .filter_map(|summary| {
                let rest = summary.key.strip_prefix(prefix)?;
                let last_slash = rest.rfind('/')?;
                let id = &rest[..last_slash];
                if id.is_empty() {
                    return None;
                }
                let updated_timestamp = summary.last_modified.timestamp_millis();
                let name = (object_type == ObjectType::CanaryConfig).then(|| {
                    let filename = &rest[last_slash + 1..];
                    filename.strip_suffix(".json").unwrap_or(filename).to_string()
                });
                Some(ObjectListEntry {
                    id: id.to_string(),
                    name,
                    updated_timestamp,
                    updated_timestamp_iso: iso_millis(updated_timestamp),
                    applications: None,
                })
            })
            .collect()
    }
}

#[async_trait]
impl StorageService for ObjectStoreStorageService {
    fn services_account(&self, account_name: &str) -> bool {
        self.account_names.contains(account_name)
    }

    async fn load_object<T>(
        &self,
        account_name: &str,
        object_type: ObjectType,
        object_key: &str,
    ) -> StorageResult<T>
    where
        T: DeserializeOwned + Send,
    {
        let account = self.account(account_name)?;
        let path = resolve_singular_path(&account, object_type, object_key).await?;

        let deserialization = |reason: String| {
            error!("Failed to load {} {}", object_type.group(), object_key);
            StorageError::Deserialization {
                key: object_key.to_string(),
                reason,
            }
        };

        let body = account
            .client
            .get_object(&account.bucket, &path)
            .await
            .map_err(|err| deserialization(err.to_string()))?;
        serde_json::from_slice(&body).map_err(|err| deserialization(err.to_string()))
    }

    async fn store_object<T>(
        &self,
        account_name: &str,
        object_type: ObjectType,
        object_key: &str,
        obj: &T,
        filename: Option<&str>,
        is_update: bool,
    ) -> StorageResult<()>
    where
        T: Serialize + Sync,
    {
        let account = self.account(account_name)?;
        let path = build_path(&account, object_type, object_key, filename);
        self.ensure_bucket_exists(&account).await?;

        let serialization = |reason: String| StorageError::Serialization {
            key: object_key.to_string(),
            reason,
        };
        let body = Bytes::from(serde_json::to_vec(obj).map_err(|err| serialization(err.to_string()))?);

        let mut original_path = None;
        let mut pending = None;
        if object_type == ObjectType::CanaryConfig {
            let config: CanaryConfig =
                serde_json::from_slice(&body).map_err(|err| serialization(err.to_string()))?;

            self.check_for_duplicate_canary_config(&account, &config, object_key)
                .await?;

            if is_update {
                // Stored before the write so a rename can clean up after itself.
                original_path =
                    Some(resolve_singular_path(&account, object_type, object_key).await?);
            }

            let updated_timestamp = self.current_timestamp(object_key).await?;
            let summary = CanaryConfigSummary::new(
                object_key,
                config.name,
                updated_timestamp,
                config.applications,
            );
            pending = Some(
                self.start_pending(&account, IndexAction::Update, summary)
                    .await?,
            );
        }

        match self
            .put_and_finish(&account, &path, body, original_path.as_deref(), pending.as_mut())
            .await
        {
            Ok(()) => {
                debug!("stored {} {} at {}", object_type, object_key, path);
                Ok(())
            }
            Err(source) => {
                error!(
                    "Update failed on path {}: {}",
                    typed_folder(&account, object_type),
                    source
                );
                if let Some(pending) = pending.as_mut() {
                    pending.roll_back().await;
                }
                Err(StorageError::StorageWriteFailure { path, source })
            }
        }
    }

    async fn delete_object(
        &self,
        account_name: &str,
        object_type: ObjectType,
        object_key: &str,
    ) -> StorageResult<()> {
        let account = self.account(account_name)?;
        let path = resolve_singular_path(&account, object_type, object_key).await?;

        let mut pending = None;
        if object_type == ObjectType::CanaryConfig {
            let updated_timestamp = self.current_timestamp(object_key).await?;
            let existing = self
                .index
                .summary_from_id(&account.name, object_key)
                .await
                .map_err(|source| StorageError::Index {
                    key: object_key.to_string(),
                    source,
                })?;

            if let Some(existing) = existing {
                let summary = CanaryConfigSummary::new(
                    object_key,
                    existing.name,
                    updated_timestamp,
                    existing.applications,
                );
                pending = Some(
                    self.start_pending(&account, IndexAction::Delete, summary)
                        .await?,
                );
            }
        }

        match self
            .delete_and_finish(&account, &path, pending.as_mut())
            .await
        {
            Ok(()) => {
                debug!("deleted {} {} at {}", object_type, object_key, path);
                Ok(())
            }
            Err(source) => {
                error!("Failed to delete path {}: {}", path, source);
                if let Some(pending) = pending.as_mut() {
                    pending.roll_back().await;
                }
                Err(StorageError::StorageWriteFailure { path, source })
            }
        }
    }

    async fn list_object_keys(
        &self,
        account_name: &str,
        object_type: ObjectType,
        applications: &[String],
        skip_index: bool,
    ) -> StorageResult<Vec<ObjectListEntry>> {
        let account = self.account(account_name)?;

        if !skip_index && object_type == ObjectType::CanaryConfig {
            let summaries = self
                .index
                .summary_set(&account.name, applications)
                .await
                .map_err(|source| StorageError::Index {
                    key: object_type.group().to_string(),
                    source,
                })?;
            return Ok(summaries.into_iter().map(ObjectListEntry::from).collect());
        }

        self.ensure_bucket_exists(&account).await?;

        let prefix = format!("{}/", typed_folder(&account, object_type));
        debug!("Listing {}", object_type.group());

        let mut summaries = Vec::new();
        let mut request = ListObjectsRequest::new(&account.bucket, &prefix, MAX_KEYS);
        loop {
            let listing = account
                .client
                .list_objects(&request)
                .await
                .map_err(|source| StorageError::Backend {
                    bucket: account.bucket.clone(),
                    path: prefix.clone(),
                    source,
                })?;

            let page_len = listing.summaries.len();
            let next_marker = listing
                .next_marker
                .clone()
                .or_else(|| listing.summaries.last().map(|s| s.key.clone()));
            summaries.extend(listing.summaries);

            // A short page always ends the listing.
            if page_len < MAX_KEYS || !listing.is_truncated || next_marker.is_none() {
                break;
            }
            request.marker = next_marker;
        }

        Ok(Self::to_list_entries(object_type, &prefix, summaries))
    }
}
