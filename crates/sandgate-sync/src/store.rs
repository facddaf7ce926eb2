//! Object store abstraction.
//!
//! A hierarchical, key-prefix addressable blob store with `get`, `put`
//! and `list`. Keys use `/` separators. The sync engine never deletes,
//! so the trait has no delete operation.
//!
//! # Backends
//!
//! - **`S3Store`** — any S3-compatible bucket via `aws-sdk-s3`
//! - **`LocalDirStore`** — a directory on disk, for development
//! - **`MemoryStore`** — process memory, for tests and throwaway runs

pub mod local;
pub mod s3;

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StoreError;

pub use local::LocalDirStore;
pub use s3::S3Store;

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Fetch an object. Missing keys are `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Create or overwrite an object.
    async fn put(&self, key: &str, body: Bytes) -> Result<(), StoreError>;

    /// All keys starting with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// In-memory object store.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().expect("objects lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let objects = self.objects.read().expect("objects lock");
        Ok(objects.get(key).cloned())
    }

    async fn put(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        let mut objects = self.objects.write().expect("objects lock");
        objects.insert(key.to_string(), body);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let objects = self.objects.read().expect("objects lock");
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_get_put() {
        let store = MemoryStore::new();
        assert!(store.get("a/b").await.unwrap().is_none());

        store.put("a/b", Bytes::from_static(b"one")).await.unwrap();
        store.put("a/b", Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(store.get("a/b").await.unwrap().unwrap(), "two");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn memory_store_lists_by_prefix() {
        let store = MemoryStore::new();
        for key in ["cfg/a", "cfg/sub/b", "cfgx/c", "data/d"] {
            store.put(key, Bytes::new()).await.unwrap();
        }

        assert_eq!(store.list("cfg/").await.unwrap(), vec!["cfg/a", "cfg/sub/b"]);
        assert_eq!(store.list("cfg").await.unwrap().len(), 3);
        assert!(store.list("nope/").await.unwrap().is_empty());
    }
}
