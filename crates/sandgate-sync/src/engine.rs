//! Sync engine — restore and backup of manifest entries.
//!
//! Entries are independent: a failure in one never stops the others, and
//! success is all-or-nothing per entry. Transfers are serialized by an
//! internal lock so a restore and a backup never interleave.
//!
//! Each entry carries a reconcile flag. It is set once a restore has
//! completed (or found nothing newer) in this process, and `backup()`
//! refuses to upload an unreconciled entry: a failed restore must not be
//! followed by stale local state overwriting newer remote state.

use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::manifest::{ManifestEntry, Marker, SyncManifest};
use crate::store::ObjectStore;
use crate::tree::{self, key_to_relative, write_file_atomic};

/// What `restore()` did for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Remote state copied into the local directory.
    Restored { files: u64, version: u64 },
    /// Local marker already at or past the remote marker.
    UpToDate,
    /// Nothing has ever been backed up for this entry.
    NoRemoteState,
}

/// What `backup()` did for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    /// Files uploaded and a new remote marker written.
    Uploaded { files: u64, version: u64 },
    /// Local tree matches the last sync.
    Unchanged,
    /// Local directory missing or empty.
    NoLocalState,
}

/// Per-entry results of one `restore()` or `backup()` pass.
#[derive(Debug)]
pub struct SyncReport<T> {
    pub outcomes: Vec<(String, T)>,
    pub failures: Vec<(String, SyncError)>,
}

impl<T> Default for SyncReport<T> {
    fn default() -> Self {
        Self {
            outcomes: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<T> SyncReport<T> {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn outcome(&self, entry: &str) -> Option<&T> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == entry)
            .map(|(_, o)| o)
    }

    pub fn failure(&self, entry: &str) -> Option<&SyncError> {
        self.failures
            .iter()
            .find(|(name, _)| name == entry)
            .map(|(_, e)| e)
    }
}

/// Observable state of one entry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EntryStatus {
    pub name: String,
    pub reconciled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restore_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_backup_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Restores and backs up manifest entries against an object store.
pub struct SyncEngine {
    store: Arc<dyn ObjectStore>,
    manifest: SyncManifest,
    /// Held for the duration of every transfer.
    transfer: Mutex<()>,
    status: RwLock<Vec<EntryStatus>>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn ObjectStore>, manifest: SyncManifest) -> Self {
        let status = manifest
            .entries()
            .iter()
            .map(|e| EntryStatus {
                name: e.name.clone(),
                ..EntryStatus::default()
            })
            .collect();
        Self {
            store,
            manifest,
            transfer: Mutex::new(()),
            status: RwLock::new(status),
        }
    }

    pub fn manifest(&self) -> &SyncManifest {
        &self.manifest
    }

    /// Snapshot of every entry's status, in manifest order.
    pub fn status(&self) -> Vec<EntryStatus> {
        self.status.read().expect("status lock").clone()
    }

    /// Whether every entry has been reconciled in this process.
    pub fn is_reconciled(&self) -> bool {
        self.status
            .read()
            .expect("status lock")
            .iter()
            .all(|s| s.reconciled)
    }

    /// Bring local state up to date with remote state.
    pub async fn restore(&self) -> SyncReport<RestoreOutcome> {
        let _guard = self.transfer.lock().await;
        let mut report = SyncReport::default();

        for (idx, entry) in self.manifest.entries().iter().enumerate() {
            match self.reconcile(idx, entry).await {
                Ok(outcome) => report.outcomes.push((entry.name.clone(), outcome)),
                Err(e) => report.failures.push((entry.name.clone(), e)),
            }
        }

        info!(
            entries = self.manifest.len(),
            failed = report.failures.len(),
            "restore pass complete"
        );
        report
    }

    /// Push local state to the store.
    pub async fn backup(&self) -> SyncReport<BackupOutcome> {
        let _guard = self.transfer.lock().await;
        let mut report = SyncReport::default();

        for (idx, entry) in self.manifest.entries().iter().enumerate() {
            if !self.entry_reconciled(idx) {
                if let Err(e) = self.reconcile(idx, entry).await {
                    warn!(entry = %entry.name, "skipping backup of unreconciled entry");
                    report.failures.push((entry.name.clone(), e));
                    continue;
                }
            }

            match self.backup_entry(entry).await {
                Ok(outcome) => {
                    if let BackupOutcome::Uploaded { version, .. } = outcome {
                        self.update_status(idx, |s| {
                            s.marker_version = Some(version);
                            s.last_backup_ms = Some(now_ms());
                            s.last_error = None;
                        });
                    }
                    report.outcomes.push((entry.name.clone(), outcome));
                }
                Err(e) => {
                    error!(entry = %entry.name, error = %e, "backup failed");
                    self.update_status(idx, |s| s.last_error = Some(e.to_string()));
                    report.failures.push((entry.name.clone(), e));
                }
            }
        }

        debug!(
            entries = self.manifest.len(),
            failed = report.failures.len(),
            "backup pass complete"
        );
        report
    }

    /// Restore one entry and record the reconcile result.
    async fn reconcile(&self, idx: usize, entry: &ManifestEntry) -> SyncResult<RestoreOutcome> {
        match self.restore_entry(entry).await {
            Ok(outcome) => {
                self.update_status(idx, |s| {
                    s.reconciled = true;
                    s.last_error = None;
                    if let RestoreOutcome::Restored { version, .. } = outcome {
                        s.marker_version = Some(version);
                        s.last_restore_ms = Some(now_ms());
                    }
                });
                Ok(outcome)
            }
            Err(e) => {
                error!(entry = %entry.name, error = %e, "restore failed");
                self.update_status(idx, |s| s.last_error = Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn restore_entry(&self, entry: &ManifestEntry) -> SyncResult<RestoreOutcome> {
        let Some(remote) = self.read_remote_marker(entry).await? else {
            debug!(entry = %entry.name, "no remote marker, nothing to restore");
            return Ok(RestoreOutcome::NoRemoteState);
        };

        if let Some(local) = read_local_marker(entry).await {
            if local.version >= remote.version {
                debug!(
                    entry = %entry.name,
                    local = local.version,
                    remote = remote.version,
                    "local state is current"
                );
                return Ok(RestoreOutcome::UpToDate);
            }
        }

        let keys = self
            .store
            .list(&entry.list_prefix())
            .await
            .map_err(|e| SyncError::transfer(&entry.name, e))?;
        let mut copied = 0u64;
        for key in &keys {
            let Some(suffix) = entry.relative_of(key) else {
                continue;
            };
            if tree::is_marker_name(suffix) {
                continue;
            }
            let Some(relative) = key_to_relative(suffix) else {
                warn!(entry = %entry.name, %key, "skipping object with unsafe key");
                continue;
            };
            let Some(body) = self
                .store
                .get(key)
                .await
                .map_err(|e| SyncError::transfer(&entry.name, e))?
            else {
                continue;
            };
            write_file_atomic(&entry.local_dir.join(relative), &body)
                .await
                .map_err(|e| SyncError::io(&entry.name, e))?;
            copied += 1;
        }

        // The local marker records what is on disk now, which may include
        // local-only files the store has never seen.
        let snapshot = tree::snapshot(&entry.local_dir)
            .await
            .map_err(|e| SyncError::io(&entry.name, e))?;
        let (digest, files) = snapshot
            .map(|s| (s.digest, s.files.len() as u64))
            .unwrap_or_default();
        let local = Marker {
            version: remote.version,
            digest,
            files,
        };
        write_file_atomic(&entry.local_marker_path(), &local.to_bytes())
            .await
            .map_err(|e| SyncError::io(&entry.name, e))?;

        info!(
            entry = %entry.name,
            files = copied,
            version = remote.version,
            "restored entry from remote"
        );
        Ok(RestoreOutcome::Restored {
            files: copied,
            version: remote.version,
        })
    }

    async fn backup_entry(&self, entry: &ManifestEntry) -> SyncResult<BackupOutcome> {
        let snapshot = match tree::snapshot(&entry.local_dir).await {
            Ok(Some(s)) if !s.is_empty() => s,
            Ok(_) => return Ok(BackupOutcome::NoLocalState),
            Err(e) => return Err(SyncError::io(&entry.name, e)),
        };

        let local = read_local_marker(entry).await;
        let remote = self.read_remote_marker(entry).await?;

        if let (Some(l), Some(r)) = (&local, &remote) {
            if l.digest == snapshot.digest && l.version == r.version {
                debug!(entry = %entry.name, "entry unchanged since last sync");
                return Ok(BackupOutcome::Unchanged);
            }
        }
        if let Some(r) = &remote {
            if local.as_ref().is_none_or(|l| r.version > l.version) {
                warn!(
                    entry = %entry.name,
                    remote = r.version,
                    local = local.as_ref().map(|l| l.version),
                    "remote marker advanced since last sync, overwriting (last writer wins)"
                );
            }
        }

        let mut uploaded = 0u64;
        for file in &snapshot.files {
            let data = match tokio::fs::read(&file.path).await {
                Ok(data) => data,
                // Deleted since the snapshot; the digest changes next tick.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(SyncError::io(&entry.name, e)),
            };
            self.store
                .put(&entry.object_key(&file.relative), Bytes::from(data))
                .await
                .map_err(|e| SyncError::transfer(&entry.name, e))?;
            uploaded += 1;
        }

        let version = remote
            .as_ref()
            .map_or(0, |r| r.version + 1)
            .max(now_ms());
        let marker = Marker {
            version,
            digest: snapshot.digest,
            files: snapshot.files.len() as u64,
        };

        self.store
            .put(&entry.remote_marker_key(), Bytes::from(marker.to_bytes()))
            .await
            .map_err(|e| SyncError::MarkerWriteFailed {
                entry: entry.name.clone(),
                reason: e.to_string(),
            })?;

        if let Err(e) = write_file_atomic(&entry.local_marker_path(), &marker.to_bytes()).await {
            // Remote is consistent; the next tick re-uploads and retries.
            warn!(entry = %entry.name, error = %e, "failed to write local marker");
        }

        info!(
            entry = %entry.name,
            files = uploaded,
            version,
            "backed up entry"
        );
        Ok(BackupOutcome::Uploaded {
            files: uploaded,
            version,
        })
    }

    async fn read_remote_marker(&self, entry: &ManifestEntry) -> SyncResult<Option<Marker>> {
        let Some(body) = self
            .store
            .get(&entry.remote_marker_key())
            .await
            .map_err(|e| SyncError::transfer(&entry.name, e))?
        else {
            return Ok(None);
        };
        Marker::from_bytes(&body)
            .map(Some)
            .map_err(|e| SyncError::transfer(&entry.name, format!("corrupt remote marker: {e}")))
    }

    fn entry_reconciled(&self, idx: usize) -> bool {
        self.status.read().expect("status lock")[idx].reconciled
    }

    fn update_status(&self, idx: usize, f: impl FnOnce(&mut EntryStatus)) {
        let mut status = self.status.write().expect("status lock");
        f(&mut status[idx]);
    }
}

/// Local marker, or `None` if missing or unreadable (forces a restore).
async fn read_local_marker(entry: &ManifestEntry) -> Option<Marker> {
    let data = tokio::fs::read(entry.local_marker_path()).await.ok()?;
    match Marker::from_bytes(&data) {
        Ok(marker) => Some(marker),
        Err(e) => {
            warn!(entry = %entry.name, error = %e, "ignoring corrupt local marker");
            None
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
