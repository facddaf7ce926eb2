//! Manifest entries and sync markers.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use sandgate_core::EntryConfig;

/// File name of the marker, both locally and under the remote prefix.
pub const MARKER_NAME: &str = ".sandgate-marker";

/// A local directory mirrored under a remote key prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name: String,
    pub local_dir: PathBuf,
    /// Normalized: no leading or trailing `/`.
    pub remote_prefix: String,
}

impl ManifestEntry {
    pub fn new(
        name: impl Into<String>,
        local_dir: impl AsRef<Path>,
        remote_prefix: &str,
    ) -> Self {
        Self {
            name: name.into(),
            local_dir: local_dir.as_ref().to_path_buf(),
            remote_prefix: remote_prefix.trim_matches('/').to_string(),
        }
    }

    /// Prefix used when listing, including the trailing `/`.
    pub fn list_prefix(&self) -> String {
        format!("{}/", self.remote_prefix)
    }

    /// Object key for a `/`-separated path relative to `local_dir`.
    pub fn object_key(&self, relative: &str) -> String {
        format!("{}/{relative}", self.remote_prefix)
    }

    pub fn remote_marker_key(&self) -> String {
        self.object_key(MARKER_NAME)
    }

    pub fn local_marker_path(&self) -> PathBuf {
        self.local_dir.join(MARKER_NAME)
    }

    /// Inverse of `object_key`; `None` for keys outside this entry.
    pub fn relative_of<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.remote_prefix)?.strip_prefix('/')
    }
}

impl From<&EntryConfig> for ManifestEntry {
    fn from(config: &EntryConfig) -> Self {
        Self::new(&config.name, &config.local_dir, &config.remote_prefix)
    }
}

/// Ordered set of manifest entries. Entries are processed in order.
#[derive(Debug, Clone, Default)]
pub struct SyncManifest {
    entries: Vec<ManifestEntry>,
}

impl SyncManifest {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    pub fn from_config(entries: &[EntryConfig]) -> Self {
        Self::new(entries.iter().map(ManifestEntry::from).collect())
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Sentinel recording the last successful sync of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    /// Monotonic per entry; epoch milliseconds at the time of the backup.
    pub version: u64,
    /// Tree digest at the time the marker was written.
    pub digest: String,
    /// Number of files covered by `digest`.
    pub files: u64,
}

impl Marker {
    pub fn to_bytes(&self) -> Vec<u8> {
        // A struct of plain fields always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
