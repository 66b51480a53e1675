//! Mapping of (account, object type, key) to object paths.
//!
//! Every object lives at `{root}/{group}/{key}/{filename}`. Writers always
//! know the filename; readers and deleters discover it by listing the key's
//! folder, since a canary config's filename can change while its key stays.

use crate::{
    models::{account::Account, object_type::ObjectType},
    services::{
        backend::{BackendError, ListObjectsRequest},
        storage_service::{StorageError, StorageResult},
    },
};
use tracing::debug;

/// Page size used when resolving a single object's path.
pub const SINGULAR_LISTING_MAX_KEYS: usize = 100;

/// Collapse runs of `/` and drop a leading `/` left by an empty root folder.
fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c == '/' && (out.is_empty() || out.ends_with('/')) {
            continue;
        }
        out.push(c);
    }
    out
}

/// `{root}/{name}`.
pub fn dao_root(account: &Account, name: &str) -> String {
    normalize(&format!("{}/{}", account.root_folder, name))
}

/// Folder holding every object of `object_type`.
pub fn typed_folder(account: &Account, object_type: ObjectType) -> String {
    dao_root(account, object_type.group())
}

/// Path an object is written to.
///
/// `filename` defaults to the type's default filename. A key that already
/// ends with the filename is taken to be a full path and returned as is.
pub fn build_path(
    account: &Account,
    object_type: ObjectType,
    object_key: &str,
    filename: Option<&str>,
) -> String {
    let filename = filename.unwrap_or(object_type.default_filename());
    if object_key.ends_with(filename) {
        return object_key.to_string();
    }
    normalize(&format!(
        "{}/{}/{}",
        typed_folder(account, object_type),
        object_key,
        filename
    ))
}

/// Find the path of the single object stored under `object_key` by listing
/// its folder and taking the first entry.
pub async fn resolve_singular_path(
    account: &Account,
    object_type: ObjectType,
    object_key: &str,
) -> StorageResult<String> {
    let prefix = normalize(&format!(
        "{}/{}/",
        typed_folder(account, object_type),
        object_key
    ));
    let request = ListObjectsRequest::new(&account.bucket, &prefix, SINGULAR_LISTING_MAX_KEYS);
    let listing = account
        .client
        .list_objects(&request)
        .await
        .map_err(|source| match source {
            BackendError::NoSuchBucket(_) => StorageError::ObjectNotFound {
                object_type,
                path: prefix.clone(),
            },
            source => StorageError::Backend {
                bucket: account.bucket.clone(),
                path: prefix.clone(),
                source,
            },
        })?;

    match listing.summaries.into_iter().next() {
        Some(summary) => {
            debug!("resolved {} {} to {}", object_type, object_key, summary.key);
            Ok(summary.key)
        }
        None => Err(StorageError::ObjectNotFound {
            object_type,
            path: prefix,
        }),
    }
}
