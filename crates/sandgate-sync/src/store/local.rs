//! Directory-backed object store, for development without a bucket.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use walkdir::WalkDir;

use crate::error::StoreError;
use crate::store::ObjectStore;
use crate::tree::{is_temp_name, key_to_relative, relative_to_key, write_file_atomic};

/// Stores each object as a file under `root`, keyed by relative path.
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        key_to_relative(key)
            .map(|rel| self.root.join(rel))
            .ok_or_else(|| StoreError::new(format!("invalid object key: {key:?}")))
    }
}

#[async_trait]
impl ObjectStore for LocalDirStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(buf) => Ok(Some(Bytes::from(buf))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::new(format!("read {}: {e}", path.display()))),
        }
    }

    async fn put(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        write_file_atomic(&path, &body)
            .await
            .map_err(|e| StoreError::new(format!("write {}: {e}", path.display())))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut keys = Vec::new();
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = entry.map_err(|e| StoreError::new(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let Some(key) = relative_to_key(rel) else {
                    continue;
                };
                if key.starts_with(&prefix) && !is_temp_name(&key) {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(|e| StoreError::new(format!("list task failed: {e}")))?
    }
}
