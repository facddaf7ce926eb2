//! Periodic backup loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::engine::{BackupOutcome, SyncEngine, SyncReport};
use crate::error::SyncError;

/// Runs `SyncEngine::backup` on a fixed interval.
///
/// Ticks never overlap: the next sleep starts only after the previous
/// backup returned or hit `tick_timeout`.
pub struct BackupScheduler {
    engine: Arc<SyncEngine>,
    interval: Duration,
    tick_timeout: Duration,
}

impl BackupScheduler {
    pub fn new(engine: Arc<SyncEngine>, interval: Duration, tick_timeout: Duration) -> Self {
        Self {
            engine,
            interval,
            tick_timeout,
        }
    }

    /// One backup pass, bounded by the tick timeout.
    pub async fn tick(&self) -> Result<SyncReport<BackupOutcome>, SyncError> {
        let report = tokio::time::timeout(self.tick_timeout, self.engine.backup())
            .await
            .map_err(|_| SyncError::Timeout(self.tick_timeout))?;

        let uploaded = report
            .outcomes
            .iter()
            .filter(|(_, o)| matches!(o, BackupOutcome::Uploaded { .. }))
            .count();
        if report.is_clean() {
            debug!(uploaded, "backup tick complete");
        } else {
            warn!(
                uploaded,
                failed = report.failures.len(),
                "backup tick finished with failures"
            );
        }
        Ok(report)
    }

    /// Run until `shutdown` fires, then take one final backup.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            entries = self.engine.manifest().len(),
            "backup scheduler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "backup tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("backup scheduler shutting down, running final backup");
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "final backup failed");
                    }
                    break;
                }
            }
        }
    }
}
