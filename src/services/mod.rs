//! Storage engine: accounts, path resolution, retry, the canary-config index
//! and the storage service tying them together.

pub mod accounts;
pub mod backend;
pub mod canary_index;
pub mod local_disk;
pub mod paths;
pub mod retry;
pub mod sqlite_index;
pub mod storage_service;

#[cfg(test)]
pub(crate) mod testing;
