//! Task Dispatcher: hands work to the queue and answers questions about it.

use std::sync::Arc;
use std::time::Duration;

use jokbo_core::error::CoreError;
use jokbo_core::live_task::{extract_embedded_job_id, LiveTaskView};
use jokbo_core::task::{RevokeRequest, RevokeSignal, TaskKind};
use jokbo_core::types::{JobId, TaskId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::queue::{QueueError, TaskQueue, TaskSpec, TaskStatusView};

/// Positional and keyword arguments of one task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }
}

/// Handle to a dispatched fan-out group.
///
/// `aggregation_task_id` is the awaitable result of the whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHandle {
    pub group_id: String,
    pub task_ids: Vec<TaskId>,
    pub aggregation_task_id: TaskId,
}

fn dispatch_error(err: QueueError) -> CoreError {
    match err {
        QueueError::Unavailable(msg) => CoreError::DispatchFailure(msg),
        QueueError::NotFound(id) => CoreError::not_found("Task", id),
        QueueError::Invalid(msg) => CoreError::Internal(msg),
    }
}

fn revoke_request(forceful: bool, signal: RevokeSignal) -> RevokeRequest {
    if forceful {
        RevokeRequest::forceful(signal)
    } else {
        RevokeRequest::cooperative()
    }
}

#[derive(Clone)]
pub struct TaskDispatcher {
    queue: Arc<dyn TaskQueue>,
    max_retries: u32,
}

impl TaskDispatcher {
    pub fn new(queue: Arc<dyn TaskQueue>, max_retries: u32) -> Self {
        Self { queue, max_retries }
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    /// Dispatch one task for a job. `DispatchFailure` if the queue is
    /// unreachable.
    pub async fn submit_single(
        &self,
        job_id: &JobId,
        kind: TaskKind,
        args: TaskArgs,
    ) -> Result<TaskId, CoreError> {
        let spec = TaskSpec::new(kind, Some(job_id.clone()))
            .with_args(args.args)
            .with_kwargs(args.kwargs)
            .with_max_retries(self.max_retries);
        let task_id = self.queue.enqueue(spec).await.map_err(dispatch_error)?;
        tracing::info!(job_id = %job_id, task_id = %task_id, kind = %kind, "Task dispatched");
        Ok(task_id)
    }

    /// Dispatch one `kind` member per argument set, joined by an
    /// aggregation continuation that runs once after all of them settle.
    pub async fn submit_batch(
        &self,
        job_id: &JobId,
        kind: TaskKind,
        arg_sets: Vec<TaskArgs>,
    ) -> Result<BatchHandle, CoreError> {
        if arg_sets.is_empty() {
            return Err(CoreError::Validation(
                "A batch needs at least one unit".to_string(),
            ));
        }
        let members = arg_sets
            .into_iter()
            .map(|a| {
                TaskSpec::new(kind, Some(job_id.clone()))
                    .with_args(a.args)
                    .with_kwargs(a.kwargs)
                    .with_max_retries(self.max_retries)
            })
            .collect();
        let callback = TaskSpec::new(TaskKind::AggregateBatch, Some(job_id.clone()))
            .with_args(vec![Value::String(job_id.to_string())])
            .with_max_retries(self.max_retries);

        let receipt = self
            .queue
            .enqueue_group(Some(job_id), members, callback)
            .await
            .map_err(dispatch_error)?;
        tracing::info!(
            job_id = %job_id,
            group_id = %receipt.group_id,
            units = receipt.member_ids.len(),
            aggregation_task_id = %receipt.callback_id,
            "Batch dispatched"
        );
        Ok(BatchHandle {
            group_id: receipt.group_id,
            task_ids: receipt.member_ids,
            aggregation_task_id: receipt.callback_id,
        })
    }

    pub async fn status(&self, task_id: &str) -> Result<TaskStatusView, CoreError> {
        self.queue
            .status(task_id)
            .await
            .map_err(dispatch_error)?
            .ok_or_else(|| CoreError::not_found("Task", task_id))
    }

    /// Poll a task until it settles or `timeout` elapses.
    ///
    /// Returns the last view seen; callers check `state.is_terminal()`.
    pub async fn await_task(
        &self,
        task_id: &str,
        poll: Duration,
        timeout: Duration,
    ) -> Result<TaskStatusView, CoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let view = self.status(task_id).await?;
            if view.state.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(view);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Revoke one task. Never fails: returns whether the queue accepted.
    pub async fn revoke(&self, task_id: &str, forceful: bool, signal: RevokeSignal) -> bool {
        match self
            .queue
            .revoke(task_id, revoke_request(forceful, signal))
            .await
        {
            Ok(prior) => {
                tracing::info!(task_id, forceful, prior = %prior, "Task revoked");
                true
            }
            Err(e) => {
                tracing::warn!(task_id, error = %e, "Revoke failed");
                false
            }
        }
    }

    /// Revoke every unfinished task of a job. Never fails.
    pub async fn revoke_job(&self, job_id: &JobId, forceful: bool, signal: RevokeSignal) -> bool {
        match self
            .queue
            .revoke_job(job_id, revoke_request(forceful, signal))
            .await
        {
            Ok(hit) => {
                tracing::info!(job_id = %job_id, forceful, hit, "Job tasks revoked");
                true
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Job revoke failed");
                false
            }
        }
    }

    /// Every task the queue reports in flight, with a best-guess job id.
    pub async fn list_live_tasks(&self) -> Result<Vec<LiveTaskView>, CoreError> {
        let raw = self.queue.live_tasks().await.map_err(dispatch_error)?;
        Ok(raw
            .into_iter()
            .map(|t| LiveTaskView {
                embedded_job_id: extract_embedded_job_id(&t.args, &t.kwargs),
                task_id: t.task_id,
                worker: t.worker,
                state: t.state,
                routing_key: t.routing_key,
            })
            .collect())
    }

    /// Drop settled tasks older than `cutoff`.
    pub async fn purge_finished_before(&self, cutoff: Timestamp) -> Result<u64, CoreError> {
        self.queue
            .purge_finished_before(cutoff)
            .await
            .map_err(dispatch_error)
    }
}
