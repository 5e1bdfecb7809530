//! Periodic snapshots of the queue into a blob store.
//!
//! A snapshot is the queue exported head-to-tail as a JSON array of strings,
//! uploaded under `<prefix><RFC3339 timestamp>.state`. Three cron jobs keep
//! the store current: `snapshot` writes a new blob, `report` publishes age and
//! size gauges, `prune` deletes blobs older than the retention window.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{debug, error, info, warn};

use crate::config::SnapshotConfig;
use crate::core::Queue;
use crate::metrics;
use crate::storage::{BlobStore, StorageError};

pub const SUFFIX: &str = ".state";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] JobSchedulerError),
}

/// A blob in the store, identified by the time it was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub size: u64,
}

impl Snapshot {
    /// Time elapsed since the snapshot was taken; zero if it lies in the future.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.timestamp).to_std().unwrap_or_default()
    }
}

/// Blob name for a snapshot taken at `at`.
pub fn snapshot_name(prefix: &str, at: DateTime<Utc>) -> String {
    format!(
        "{prefix}{}{SUFFIX}",
        at.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// Recovers the timestamp embedded in a blob name.
///
/// `None` means the blob does not belong to this prefix at all;
/// `Some(Err(_))` means it looks like ours but the timestamp is bad.
fn parse_name(prefix: &str, name: &str) -> Option<Result<DateTime<Utc>, chrono::ParseError>> {
    let stamp = name.strip_prefix(prefix)?.strip_suffix(SUFFIX)?;
    Some(DateTime::parse_from_rfc3339(stamp).map(|ts| ts.with_timezone(&Utc)))
}

/// Drives export, listing, pruning and restore of queue snapshots.
#[derive(Clone)]
pub struct Snapshotter {
    queue: Arc<Queue>,
    store: Arc<dyn BlobStore>,
    config: Arc<SnapshotConfig>,
    scheduler: Arc<Mutex<Option<JobScheduler>>>,
}

impl Snapshotter {
    pub fn new(queue: Arc<Queue>, store: Arc<dyn BlobStore>, config: SnapshotConfig) -> Self {
        Self {
            queue,
            store,
            config: Arc::new(config),
            scheduler: Arc::new(Mutex::new(None)),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Exports the queue and uploads it as a new blob.
    pub async fn snapshot(&self) -> Result<Snapshot, SnapshotError> {
        self.snapshot_at(Utc::now()).await
    }

    async fn snapshot_at(&self, at: DateTime<Utc>) -> Result<Snapshot, SnapshotError> {
        // Names only carry whole seconds.
        let at = at.trunc_subsecs(0);
        let items = self.queue.export();
        let body = serde_json::to_vec(&items)?;
        let name = snapshot_name(&self.config.name_prefix, at);

        self.store.upload(&name, &body).await?;
        info!(snapshot = %name, items = items.len(), bytes = body.len(), "snapshot written");

        Ok(Snapshot {
            timestamp: at,
            name,
            size: body.len() as u64,
        })
    }

    /// Every snapshot in the store, oldest first. Blobs whose names do not
    /// parse are skipped.
    pub async fn collect(&self) -> Result<Vec<Snapshot>, SnapshotError> {
        let prefix = self.config.name_prefix.as_str();
        let mut snapshots = Vec::new();

        for name in self.store.iter().await? {
            let timestamp = match parse_name(prefix, &name) {
                None => {
                    debug!(blob = %name, "ignoring foreign blob");
                    continue;
                }
                Some(Err(e)) => {
                    warn!(blob = %name, error = %e, "skipping snapshot with unparsable name");
                    continue;
                }
                Some(Ok(ts)) => ts,
            };

            // The blob may have been pruned since it was listed.
            let size = match self.store.attributes(&name).await {
                Ok(attrs) => attrs.size,
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            snapshots.push(Snapshot {
                timestamp,
                name,
                size,
            });
        }

        snapshots.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(snapshots)
    }

    /// Publishes per-blob age/size gauges and the age of the newest blob.
    pub async fn report(&self) -> Result<(), SnapshotError> {
        let snapshots = self.collect().await?;
        for snapshot in &snapshots {
            metrics::set_snapshot_gauges(&snapshot.name, snapshot.age(), snapshot.size);
        }
        if let Some(latest) = snapshots.last() {
            metrics::set_latest_snapshot_age(latest.age());
        }
        debug!(count = snapshots.len(), "snapshot report published");
        Ok(())
    }

    /// Deletes every snapshot older than the retention window and returns
    /// how many were removed. Individual delete failures are logged.
    pub async fn prune(&self) -> Result<usize, SnapshotError> {
        self.prune_at(Utc::now()).await
    }

    async fn prune_at(&self, now: DateTime<Utc>) -> Result<usize, SnapshotError> {
        let retention = chrono::Duration::days(i64::from(self.config.retention_days));
        // A window reaching past the earliest representable time keeps everything.
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            debug!(retention_days = self.config.retention_days, "retention window unbounded");
            return Ok(0);
        };
        let mut removed = 0;

        for snapshot in self.collect().await? {
            if snapshot.timestamp >= cutoff {
                continue;
            }
            match self.store.delete(&snapshot.name).await {
                Ok(true) => {
                    info!(snapshot = %snapshot.name, "pruned snapshot");
                    removed += 1;
                }
                Ok(false) => debug!(snapshot = %snapshot.name, "snapshot already gone"),
                Err(e) => warn!(snapshot = %snapshot.name, error = %e, "failed to prune snapshot"),
            }
        }

        Ok(removed)
    }

    /// The newest snapshot, if any.
    pub async fn latest(&self) -> Result<Option<Snapshot>, SnapshotError> {
        Ok(self.collect().await?.pop())
    }

    /// Downloads a snapshot and decodes its items in queue order.
    pub async fn open(&self, snapshot: &Snapshot) -> Result<Vec<String>, SnapshotError> {
        let body = self.store.get(&snapshot.name).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Replaces the queue contents with the newest snapshot and returns the
    /// number of items loaded. An empty store leaves the queue untouched.
    pub async fn restore(&self) -> Result<usize, SnapshotError> {
        let Some(latest) = self.latest().await? else {
            info!("no snapshot to restore");
            return Ok(0);
        };

        let items = self.open(&latest).await?;
        self.queue.drain();
        let restored = self.queue.import(items);
        info!(snapshot = %latest.name, restored, "queue restored from snapshot");
        Ok(restored)
    }

    /// Schedules the snapshot, report and prune jobs. Does nothing when
    /// snapshots are disabled.
    pub async fn start(&self) -> Result<(), SnapshotError> {
        if !self.config.enabled {
            info!("snapshots disabled");
            return Ok(());
        }

        let mut slot = self.scheduler.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let scheduler = JobScheduler::new().await?;
        self.add_job(&scheduler, "snapshot", &self.config.schedule, |s| async move {
            s.snapshot().await.map(|_| ())
        })
        .await?;
        self.add_job(&scheduler, "report", &self.config.report_schedule, |s| async move {
            s.report().await
        })
        .await?;
        self.add_job(&scheduler, "prune", &self.config.prune_schedule, |s| async move {
            s.prune().await.map(|_| ())
        })
        .await?;
        scheduler.start().await?;

        info!(
            schedule = %self.config.schedule,
            retention_days = self.config.retention_days,
            "snapshot jobs started"
        );
        *slot = Some(scheduler);
        Ok(())
    }

    async fn add_job<F, Fut>(
        &self,
        scheduler: &JobScheduler,
        job: &'static str,
        schedule: &str,
        run: F,
    ) -> Result<(), SnapshotError>
    where
        F: Fn(Snapshotter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SnapshotError>> + Send + 'static,
    {
        let this = self.clone();
        let job = Job::new_async(schedule, move |_id, _scheduler| {
            let run = run(this.clone());
            Box::pin(async move {
                match run.await {
                    Ok(()) => metrics::inc_snapshot_runs(job, "success"),
                    Err(e) => {
                        error!(job = job, error = %e, "durability job failed");
                        metrics::inc_snapshot_runs(job, "error");
                    }
                }
            })
        })?;
        scheduler.add(job).await?;
        Ok(())
    }

    /// Stops the scheduled jobs, then writes one last snapshot.
    pub async fn shutdown(&self) -> Result<(), SnapshotError> {
        if let Some(mut scheduler) = self.scheduler.lock().await.take() {
            scheduler.shutdown().await?;
            debug!("snapshot jobs stopped");
        }
        if self.config.enabled {
            self.snapshot().await?;
        }
        Ok(())
    }
}
