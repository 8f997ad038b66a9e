//! Cancellation Coordinator and the probe handed to running units.
//!
//! A job is cancelled by setting a persistent flag and revoking its tasks.
//! Units see the flag through a [`CancelProbe`] at their checkpoints; the
//! probe also trips when the worker's soft time limit or a revoke signal
//! cancels its local token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use jokbo_core::error::CoreError;
use jokbo_core::progress::MSG_CANCEL_REQUESTED;
use jokbo_core::task::RevokeSignal;
use jokbo_core::types::JobId;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::access::Requester;
use crate::dispatcher::TaskDispatcher;
use crate::progress::ProgressTracker;
use crate::registry::JobRegistry;
use crate::store::JobStore;

/// Returned by [`CancelProbe::checkpoint`] once the unit should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Job cancelled")]
pub struct Cancelled;

/// Result of cancelling a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOutcome {
    /// The queue accepted the revoke of the job's tasks.
    pub revoked: bool,
    /// The job had never been dispatched and was deleted outright.
    pub draft_deleted: bool,
}

#[derive(Clone)]
pub struct CancellationCoordinator {
    store: Arc<dyn JobStore>,
    registry: JobRegistry,
    progress: ProgressTracker,
    dispatcher: TaskDispatcher,
}

impl CancellationCoordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: JobRegistry,
        progress: ProgressTracker,
        dispatcher: TaskDispatcher,
    ) -> Self {
        Self {
            store,
            registry,
            progress,
            dispatcher,
        }
    }

    /// Set the job's cancellation flag. Idempotent.
    pub async fn request_cancel(&self, job_id: &JobId) -> Result<(), CoreError> {
        self.store.set_cancelled(job_id).await?;
        tracing::info!(job_id = %job_id, "Cancellation requested");
        Ok(())
    }

    pub async fn is_cancelled(&self, job_id: &JobId) -> Result<bool, CoreError> {
        self.store.is_cancelled(job_id).await
    }

    /// Cancel a job on behalf of `requester`.
    ///
    /// A job that was never dispatched is deleted outright. Otherwise the
    /// flag is set and every task of the job is revoked forcefully.
    pub async fn cancel_job(
        &self,
        job_id: &JobId,
        requester: &Requester,
    ) -> Result<CancelOutcome, CoreError> {
        let job = self.registry.get_metadata(job_id).await?;
        requester.authorize(&job)?;

        self.request_cancel(job_id).await?;

        let Some(task_id) = job.bound_task_id.as_deref() else {
            self.registry.delete_all(job_id).await?;
            return Ok(CancelOutcome {
                revoked: false,
                draft_deleted: true,
            });
        };

        let mut revoked = self
            .dispatcher
            .revoke(task_id, true, RevokeSignal::Sigterm)
            .await;
        if job.is_batch {
            revoked |= self
                .dispatcher
                .revoke_job(job_id, true, RevokeSignal::Sigterm)
                .await;
        }

        if let Err(e) = self.progress.set_message(job_id, MSG_CANCEL_REQUESTED).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to record cancellation message");
        }

        Ok(CancelOutcome {
            revoked,
            draft_deleted: false,
        })
    }

    /// A probe for one execution of a unit of `job_id`.
    pub fn probe(&self, job_id: JobId, local: CancellationToken) -> CancelProbe {
        CancelProbe::new(job_id, Arc::clone(&self.store), local)
    }
}

/// Cooperative cancellation check threaded through a unit's call chain.
///
/// Once the probe has reported cancellation it keeps doing so, even if the
/// store later becomes unreachable.
pub struct CancelProbe {
    job_id: JobId,
    store: Arc<dyn JobStore>,
    local: CancellationToken,
    tripped: AtomicBool,
}

impl CancelProbe {
    pub fn new(job_id: JobId, store: Arc<dyn JobStore>, local: CancellationToken) -> Self {
        Self {
            job_id,
            store,
            local,
            tripped: AtomicBool::new(false),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// The token cancelled by the worker's soft limit or a revoke.
    pub fn token(&self) -> &CancellationToken {
        &self.local
    }

    /// Consult the local token, then the persistent flag.
    ///
    /// A failed flag read counts as "not cancelled"; the next checkpoint
    /// tries again.
    pub async fn is_cancelled(&self) -> bool {
        if self.tripped.load(Ordering::Acquire) {
            return true;
        }
        let cancelled = if self.local.is_cancelled() {
            true
        } else {
            match self.store.is_cancelled(&self.job_id).await {
                Ok(flag) => flag,
                Err(e) => {
                    tracing::warn!(job_id = %self.job_id, error = %e, "Cancellation check failed");
                    false
                }
            }
        };
        if cancelled {
            self.tripped.store(true, Ordering::Release);
            self.local.cancel();
        }
        cancelled
    }

    /// `Err(Cancelled)` once the unit should stop.
    pub async fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled().await {
            tracing::debug!(job_id = %self.job_id, "Cancellation observed at checkpoint");
            return Err(Cancelled);
        }
        Ok(())
    }
}
