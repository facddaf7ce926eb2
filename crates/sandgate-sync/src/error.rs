//! Sync error types.

use std::time::Duration;

use thiserror::Error;

/// A single object store operation failed.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

/// Errors from restoring or backing up a manifest entry.
///
/// Never fatal: they are logged and the work is retried on the next tick.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transfer failed for entry {entry}: {reason}")]
    TransferFailed { entry: String, reason: String },

    #[error("marker write failed for entry {entry}: {reason}")]
    MarkerWriteFailed { entry: String, reason: String },

    #[error("sync timed out after {0:?}")]
    Timeout(Duration),

    #[error("local i/o failed for entry {entry}: {source}")]
    Io {
        entry: String,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    pub(crate) fn transfer(entry: &str, reason: impl std::fmt::Display) -> Self {
        SyncError::TransferFailed {
            entry: entry.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn io(entry: &str, source: std::io::Error) -> Self {
        SyncError::Io {
            entry: entry.to_string(),
            source,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
