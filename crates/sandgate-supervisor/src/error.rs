//! Lifecycle error types.

use thiserror::Error;

/// Why the backend could not be brought to `Ready`.
///
/// `Clone` so every caller waiting on a shared start attempt receives
/// the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("backend did not become ready in time")]
    StartTimeout,

    #[error("backend failed to start: {0}")]
    StartFailed(String),

    #[error("backend exited during startup: {0}")]
    ProcessCrashed(String),
}

impl LifecycleError {
    /// Short machine-readable name, used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleError::StartTimeout => "starting",
            LifecycleError::StartFailed(_) | LifecycleError::ProcessCrashed(_) => "unavailable",
        }
    }
}
