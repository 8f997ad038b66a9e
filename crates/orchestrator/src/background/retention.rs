//! Periodic purge of expired jobs, stale index entries and settled tasks.

use std::time::Duration;

use chrono::Utc;
use jokbo_core::error::CoreError;
use jokbo_core::types::Timestamp;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::TaskDispatcher;
use crate::registry::JobRegistry;

/// Jobs deleted per store round-trip.
const DELETE_BATCH: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub jobs_deleted: u64,
    pub index_pruned: u64,
    pub tasks_purged: u64,
}

impl RetentionReport {
    pub fn is_empty(&self) -> bool {
        self.jobs_deleted == 0 && self.index_pruned == 0 && self.tasks_purged == 0
    }
}

pub struct RetentionSweep {
    registry: JobRegistry,
    dispatcher: TaskDispatcher,
    retention: Duration,
    interval: Duration,
}

impl RetentionSweep {
    pub fn new(
        registry: JobRegistry,
        dispatcher: TaskDispatcher,
        retention: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            retention,
            interval,
        }
    }

    /// Run until `cancel` is triggered.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            retention_hours = self.retention.as_secs() / 3600,
            interval_secs = self.interval.as_secs(),
            "Retention sweep started"
        );

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Retention sweep stopping");
                    break;
                }
                _ = interval.tick() => {
                    match self.sweep_once(Utc::now()).await {
                        Ok(report) if report.is_empty() => {
                            tracing::debug!("Retention sweep: nothing to purge");
                        }
                        Ok(report) => {
                            tracing::info!(
                                jobs = report.jobs_deleted,
                                index_entries = report.index_pruned,
                                tasks = report.tasks_purged,
                                "Retention sweep: purged expired records"
                            );
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Retention sweep failed");
                        }
                    }
                }
            }
        }
    }

    /// One pass relative to `now`.
    ///
    /// A job that fails to delete is logged and left for the next pass.
    pub async fn sweep_once(&self, now: Timestamp) -> Result<RetentionReport, CoreError> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        let cutoff = now - retention;
        let mut report = RetentionReport::default();

        loop {
            let expired = self
                .registry
                .jobs_created_before(cutoff, DELETE_BATCH)
                .await?;
            let fetched = expired.len();
            let mut deleted_this_round = 0;
            for job_id in expired {
                match self.registry.delete_all(&job_id).await {
                    Ok(()) => deleted_this_round += 1,
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "Failed to purge expired job");
                    }
                }
            }
            report.jobs_deleted += deleted_this_round;
            if fetched < DELETE_BATCH || deleted_this_round == 0 {
                break;
            }
        }

        report.index_pruned = self.registry.prune_user_index(cutoff).await?;
        report.tasks_purged = self.dispatcher.purge_finished_before(cutoff).await?;
        Ok(report)
    }
}
