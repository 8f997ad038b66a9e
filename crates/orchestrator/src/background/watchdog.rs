//! Periodic report-only run of the reconciler.

use std::time::Duration;

use jokbo_core::error::CoreError;
use jokbo_core::progress::StalledJob;
use tokio_util::sync::CancellationToken;

use crate::reconciler::{GhostTask, Reconciler};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchdogFindings {
    pub ghosts: Vec<GhostTask>,
    pub stalled: Vec<StalledJob>,
}

pub struct Watchdog {
    reconciler: Reconciler,
    stall_threshold: Duration,
    interval: Duration,
}

impl Watchdog {
    pub fn new(reconciler: Reconciler, stall_threshold: Duration, interval: Duration) -> Self {
        Self {
            reconciler,
            stall_threshold,
            interval,
        }
    }

    /// Run until `cancel` is triggered. Never remediates.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            stall_threshold_secs = self.stall_threshold.as_secs(),
            "Watchdog started"
        );

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Watchdog stopping");
                    break;
                }
                _ = interval.tick() => {
                    match self.check_once().await {
                        Ok(findings) => log_findings(&findings),
                        Err(e) => tracing::error!(error = %e, "Watchdog pass failed"),
                    }
                }
            }
        }
    }

    pub async fn check_once(&self) -> Result<WatchdogFindings, CoreError> {
        let threshold = chrono::Duration::from_std(self.stall_threshold)
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        let ghosts = self.reconciler.list_ghosts().await?;
        let stalled = self.reconciler.list_stalled(threshold).await?;
        Ok(WatchdogFindings { ghosts, stalled })
    }
}

fn log_findings(findings: &WatchdogFindings) {
    if findings.ghosts.is_empty() && findings.stalled.is_empty() {
        tracing::debug!("Watchdog: no ghosts or stalled jobs");
        return;
    }
    for ghost in &findings.ghosts {
        tracing::warn!(
            task_id = %ghost.task_id,
            job_id = %ghost.job_id,
            state = %ghost.state,
            worker = ghost.worker.as_deref().unwrap_or("-"),
            "Ghost task: live in the queue without job progress"
        );
    }
    for job in &findings.stalled {
        tracing::warn!(
            job_id = %job.job_id,
            completed = job.completed,
            total = job.total,
            idle_seconds = job.idle_seconds,
            "Stalled job"
        );
    }
}
