//! Local directory trees: snapshots, digests and safe file writes.
//!
//! Traversal and hashing run on the blocking pool so request handling
//! is never stalled by a large tree.

use std::io;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::warn;
use walkdir::WalkDir;

use crate::manifest::MARKER_NAME;

/// A regular file inside a synced directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeFile {
    /// Path relative to the tree root, `/`-separated.
    pub relative: String,
    pub path: PathBuf,
}

/// Point-in-time view of a directory tree.
#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    /// Sorted by relative path. The marker file is excluded.
    pub files: Vec<TreeFile>,
    /// sha256 over every `(relative path, content hash)` pair.
    pub digest: String,
}

impl TreeSnapshot {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Walk `root` and hash its contents. `Ok(None)` if `root` does not exist.
pub async fn snapshot(root: &Path) -> io::Result<Option<TreeSnapshot>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || snapshot_blocking(&root))
        .await
        .map_err(|e| io::Error::other(format!("snapshot task failed: {e}")))?
}

fn snapshot_blocking(root: &Path) -> io::Result<Option<TreeSnapshot>> {
    if !root.is_dir() {
        return Ok(None);
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let Some(relative) = relative_to_key(rel) else {
            warn!(path = %entry.path().display(), "skipping non-UTF-8 path");
            continue;
        };
        if is_marker_name(&relative) || is_temp_name(&relative) {
            continue;
        }
        files.push(TreeFile {
            relative,
            path: entry.path().to_path_buf(),
        });
    }
    files.sort_by(|a, b| a.relative.cmp(&b.relative));

    let mut tree_hash = Sha256::new();
    for file in &files {
        let mut file_hash = Sha256::new();
        let mut reader = std::fs::File::open(&file.path)?;
        io::copy(&mut reader, &mut file_hash)?;

        tree_hash.update(file.relative.as_bytes());
        tree_hash.update([0u8]);
        tree_hash.update(file_hash.finalize());
    }

    Ok(Some(TreeSnapshot {
        files,
        digest: hex::encode(tree_hash.finalize()),
    }))
}

/// Map a `/`-separated key suffix to a relative path.
///
/// Rejects anything that could escape the directory it is joined onto:
/// absolute paths, `..`, `.`, empty segments and backslashes.
pub fn key_to_relative(key: &str) -> Option<PathBuf> {
    if key.is_empty() || key.contains('\\') {
        return None;
    }
    let mut out = PathBuf::new();
    for segment in key.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return None;
        }
        out.push(segment);
    }
    // Drive letters and other platform prefixes.
    out.components()
        .all(|c| matches!(c, Component::Normal(_)))
        .then_some(out)
}

pub(crate) fn relative_to_key(rel: &Path) -> Option<String> {
    let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
    parts.map(|p| p.join("/"))
}

/// Markers are never content, at the root or in a subdirectory.
pub(crate) fn is_marker_name(relative: &str) -> bool {
    relative.rsplit('/').next() == Some(MARKER_NAME)
}

pub(crate) fn is_temp_name(relative: &str) -> bool {
    relative
        .rsplit('/')
        .next()
        .is_some_and(|name| name.starts_with(".sandgate-tmp-"))
}

/// Write `data` to `path` via a sibling temp file and rename.
///
/// Readers never see a half-written file, even if the task is cancelled.
pub async fn write_file_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other(format!("no parent for {}", path.display())))?;
    tokio::fs::create_dir_all(parent).await?;

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::other(format!("bad file name {}", path.display())))?;
    let tmp = parent.join(format!(".sandgate-tmp-{name}"));

    tokio::fs::write(&tmp, data).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, data: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    #[tokio::test]
    async fn missing_root_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(snapshot(&dir.path().join("absent")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_lists_sorted_files_and_skips_marker() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b.txt", "b");
        write(dir.path(), "a/nested.txt", "n");
        write(dir.path(), MARKER_NAME, "{}");

        let snap = snapshot(dir.path()).await.unwrap().unwrap();
        let names: Vec<_> = snap.files.iter().map(|f| f.relative.as_str()).collect();
        assert_eq!(names, vec!["a/nested.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn nested_markers_are_not_content() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "x.txt", "x");
        write(dir.path(), &format!("sub/{MARKER_NAME}"), "{\"version\":3}");

        let snap = snapshot(dir.path()).await.unwrap().unwrap();
        let names: Vec<_> = snap.files.iter().map(|f| f.relative.as_str()).collect();
        assert_eq!(names, vec!["x.txt"]);
    }

    #[tokio::test]
    async fn digest_tracks_content_and_names() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "one");
        let first = snapshot(dir.path()).await.unwrap().unwrap().digest;
        let again = snapshot(dir.path()).await.unwrap().unwrap().digest;
        assert_eq!(first, again);

        write(dir.path(), "a.txt", "two");
        let changed = snapshot(dir.path()).await.unwrap().unwrap().digest;
        assert_ne!(first, changed);

        std::fs::rename(dir.path().join("a.txt"), dir.path().join("b.txt")).unwrap();
        let renamed = snapshot(dir.path()).await.unwrap().unwrap().digest;
        assert_ne!(changed, renamed);
    }

    #[tokio::test]
    async fn marker_changes_do_not_affect_digest() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "one");
        let before = snapshot(dir.path()).await.unwrap().unwrap().digest;
        write(dir.path(), MARKER_NAME, "{\"version\":1}");
        let after = snapshot(dir.path()).await.unwrap().unwrap().digest;
        assert_eq!(before, after);
    }

    #[test]
    fn key_to_relative_rejects_escapes() {
        assert_eq!(key_to_relative("a/b.txt"), Some(PathBuf::from("a").join("b.txt")));
        for bad in ["", "/abs", "a/../b", "..", "a//b", "./a", "a\\b", "a/"] {
            assert!(key_to_relative(bad).is_none(), "{bad:?} should be rejected");
        }
    }

    #[tokio::test]
    async fn atomic_write_creates_parents_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("x/y/z.bin");
        write_file_atomic(&target, b"payload").await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"payload");
        let leftovers: Vec<_> = std::fs::read_dir(target.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".sandgate-tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
