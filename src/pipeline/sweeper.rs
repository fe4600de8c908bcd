//! Background retention loop.
//!
//! Every interval, deletes cloud assets older than the link lifetime and local
//! downloads older than the file retention window. Failures are logged and
//! retried on the next cycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cloud::CloudStore;
use crate::config::MAX_RETENTION_HOURS;
use crate::ledger::Ledger;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub remote_deleted: usize,
    pub remote_failed: usize,
    pub local_deleted: usize,
}

pub struct RetentionSweeper {
    cloud: Arc<dyn CloudStore>,
    ledger: Ledger,
    folder: String,
    download_dir: PathBuf,
    cloud_retention: TimeDelta,
    file_retention: TimeDelta,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(
        cloud: Arc<dyn CloudStore>,
        ledger: Ledger,
        folder: String,
        download_dir: PathBuf,
        cloud_retention_hours: u64,
        file_retention_hours: u64,
        interval: Duration,
    ) -> Self {
        Self {
            cloud,
            ledger,
            folder,
            download_dir,
            cloud_retention: retention(cloud_retention_hours),
            file_retention: retention(file_retention_hours),
            interval,
        }
    }

    /// Start the loop. The first cycle runs one interval after start.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("🧹 Retention sweeper started (every {:?})", self.interval);

            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        // A cycle in flight runs to completion; `stop` bounds the wait.
                        let report = self.run_cycle(Utc::now()).await;
                        info!(
                            "🧹 Sweep done: {} remote deleted, {} remote failed, {} local deleted",
                            report.remote_deleted, report.remote_failed, report.local_deleted
                        );
                    }
                }
            }

            info!("🧹 Retention sweeper stopped");
        })
    }

    pub async fn run_cycle(&self, now: DateTime<Utc>) -> SweepReport {
        let (remote_deleted, remote_failed) = self.sweep_remote(now).await;
        let local_deleted = self.sweep_local(now).await;
        SweepReport {
            remote_deleted,
            remote_failed,
            local_deleted,
        }
    }

    async fn sweep_remote(&self, now: DateTime<Utc>) -> (usize, usize) {
        let assets = match self.cloud.list_objects(&self.folder).await {
            Ok(assets) => assets,
            Err(e) => {
                warn!("Sweeper: listing cloud assets failed: {e}");
                return (0, 0);
            }
        };

        let cutoff = now - self.cloud_retention;
        let mut deleted = 0;
        let mut failed = 0;
        for asset in assets.iter().filter(|a| a.created_at < cutoff) {
            match self.cloud.delete(&asset.id).await {
                Ok(()) => {
                    debug!("Sweeper: deleted cloud asset {}", asset.id);
                    deleted += 1;
                }
                Err(e) => {
                    warn!("Sweeper: failed to delete cloud asset {}: {e}", asset.id);
                    failed += 1;
                }
            }
        }
        (deleted, failed)
    }

    async fn sweep_local(&self, now: DateTime<Utc>) -> usize {
        let cutoff = SystemTime::from(now - self.file_retention);
        let mut entries = match tokio::fs::read_dir(&self.download_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!("Sweeper: cannot read {:?}: {e}", self.download_dir);
                return 0;
            }
        };

        let mut deleted = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Sweeper: error walking {:?}: {e}", self.download_dir);
                    break;
                }
            };

            let expired = match entry.metadata().await {
                Ok(meta) => meta.is_file() && meta.modified().is_ok_and(|m| m < cutoff),
                Err(_) => false,
            };
            if !expired {
                continue;
            }

            let path = entry.path();
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("Sweeper: failed to delete {:?}: {e}", path);
                continue;
            }
            deleted += 1;
            debug!("Sweeper: deleted local file {:?}", path);

            if let Err(e) = self.ledger.mark_deleted_by_path(&path.to_string_lossy()).await {
                warn!("Ledger: could not mark {:?} deleted: {e}", path);
            }
        }
        deleted
    }
}

fn retention(hours: u64) -> TimeDelta {
    TimeDelta::hours(hours.min(MAX_RETENTION_HOURS) as i64)
}

/// Cancel the sweeper and wait up to `grace` for it to exit, then abort it.
pub async fn stop(token: &CancellationToken, handle: JoinHandle<()>, grace: Duration) {
    token.cancel();
    let abort = handle.abort_handle();
    if tokio::time::timeout(grace, handle).await.is_err() {
        warn!("Sweeper did not stop within {:?}, aborting", grace);
        abort.abort();
    }
}
