//! Ghost/Stall Reconciler.
//!
//! A *ghost* is a task the queue still reports in flight whose job has no
//! progress record. A *stalled* job has progress that stopped advancing.
//! Both passes are best-effort: records that change or turn out malformed
//! while being classified are skipped, never reported as errors.

use chrono::Utc;
use jokbo_core::error::CoreError;
use jokbo_core::live_task::LiveTaskState;
use jokbo_core::progress::{find_stalled, StalledJob};
use jokbo_core::task::RevokeSignal;
use jokbo_core::types::{JobId, TaskId};
use serde::{Deserialize, Serialize};

use crate::cancellation::CancellationCoordinator;
use crate::dispatcher::TaskDispatcher;
use crate::progress::ProgressTracker;

/// A live task whose job has no progress record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GhostTask {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub worker: Option<String>,
    pub state: LiveTaskState,
    pub routing_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GhostReport {
    pub found: usize,
    pub revoked: usize,
    pub dry_run: bool,
    pub ghosts: Vec<GhostTask>,
}

#[derive(Clone)]
pub struct Reconciler {
    dispatcher: TaskDispatcher,
    progress: ProgressTracker,
    cancellation: CancellationCoordinator,
}

impl Reconciler {
    pub fn new(
        dispatcher: TaskDispatcher,
        progress: ProgressTracker,
        cancellation: CancellationCoordinator,
    ) -> Self {
        Self {
            dispatcher,
            progress,
            cancellation,
        }
    }

    pub async fn list_ghosts(&self) -> Result<Vec<GhostTask>, CoreError> {
        let live = self.dispatcher.list_live_tasks().await?;
        let mut ghosts = Vec::new();
        for task in live {
            let Some(job_id) = task.embedded_job_id else {
                continue;
            };
            match self.progress.read(&job_id).await {
                Ok(_) => {}
                Err(CoreError::NotFound { .. }) => ghosts.push(GhostTask {
                    task_id: task.task_id,
                    job_id,
                    worker: task.worker,
                    state: task.state,
                    routing_key: task.routing_key,
                }),
                Err(e) => {
                    tracing::debug!(task_id = %task.task_id, error = %e, "Skipping unclassifiable task");
                }
            }
        }
        Ok(ghosts)
    }

    /// Flag and forcefully revoke every ghost, or only report with `dry_run`.
    pub async fn remediate_ghosts(&self, dry_run: bool) -> Result<GhostReport, CoreError> {
        let ghosts = self.list_ghosts().await?;
        let mut revoked = 0;
        if !dry_run {
            for ghost in &ghosts {
                if let Err(e) = self.cancellation.request_cancel(&ghost.job_id).await {
                    tracing::warn!(job_id = %ghost.job_id, error = %e, "Failed to flag ghost job");
                }
                if self
                    .dispatcher
                    .revoke(&ghost.task_id, true, RevokeSignal::Sigterm)
                    .await
                {
                    revoked += 1;
                }
            }
        }
        tracing::info!(found = ghosts.len(), revoked, dry_run, "Ghost remediation finished");
        Ok(GhostReport {
            found: ghosts.len(),
            revoked,
            dry_run,
            ghosts,
        })
    }

    /// Unfinished jobs idle for at least `threshold`. Report only.
    pub async fn list_stalled(
        &self,
        threshold: chrono::Duration,
    ) -> Result<Vec<StalledJob>, CoreError> {
        let records = self.progress.unfinished().await?;
        Ok(find_stalled(&records, Utc::now(), threshold))
    }
}
