//! The task queue seam.
//!
//! [`TaskQueue`] is everything the orchestrator and the worker runtime need
//! from a broker: enqueue with an optional join barrier, late-acknowledged
//! claiming, heartbeats carrying revoke requests, retries, lost-worker
//! recovery, and enumeration of in-flight work.

use std::time::Duration;

use async_trait::async_trait;
use jokbo_core::live_task::LiveTaskState;
use jokbo_core::task::{RevokeRequest, TaskKind, TaskState, TaskStatus, TimeLimits};
use jokbo_core::types::{JobId, TaskId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod memory;
pub mod postgres;

pub use memory::MemoryTaskQueue;
pub use postgres::PgTaskQueue;

/// Default number of retries a task gets before it fails for good.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Invalid task: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// A unit of work to enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub kind: TaskKind,
    pub job_id: Option<JobId>,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub routing_key: String,
    pub max_retries: u32,
    pub limits: TimeLimits,
}

impl TaskSpec {
    /// A spec with the kind's routing key and time budget.
    pub fn new(kind: TaskKind, job_id: Option<JobId>) -> Self {
        Self {
            kind,
            job_id,
            args: Vec::new(),
            kwargs: Map::new(),
            routing_key: kind.routing_key().to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            limits: kind.default_limits(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_limits(mut self, limits: TimeLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Ids assigned to an enqueued fan-out group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupReceipt {
    pub group_id: String,
    /// In member order.
    pub member_ids: Vec<TaskId>,
    pub callback_id: TaskId,
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// A task reserved by a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedTask {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub job_id: Option<JobId>,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// Executions already attempted before this one.
    pub attempts: u32,
    pub max_retries: u32,
    pub limits: TimeLimits,
    pub group_id: Option<String>,
    pub member_index: Option<u32>,
    /// Settled group members, ordered by index. Only set on join callbacks.
    pub group_results: Vec<MemberOutcome>,
}

impl ClaimedTask {
    pub fn retries_left(&self) -> bool {
        self.attempts < self.max_retries
    }
}

/// Terminal outcome of one group member, as seen by the join callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberOutcome {
    pub task_id: TaskId,
    pub member_index: u32,
    pub state: TaskState,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Terminal report from a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded(Value),
    Failed(String),
    Revoked(String),
}

impl TaskOutcome {
    pub fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Succeeded(_) => TaskState::Succeeded,
            TaskOutcome::Failed(_) => TaskState::Failed,
            TaskOutcome::Revoked(_) => TaskState::Revoked,
        }
    }
}

/// Result of a terminal report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinishReceipt {
    /// `false` for a duplicate report on an already-terminal task.
    pub transitioned: bool,
    /// Join callback released by this report, if any.
    pub fired_callback: Option<TaskId>,
}

/// What a heartbeat learned about the lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lease {
    Held,
    RevokeRequested(RevokeRequest),
    /// The task was requeued or settled without this worker.
    Lost,
}

/// Counts from one lost-task sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LostSweep {
    pub requeued: u64,
    pub failed: u64,
    pub revoked: u64,
}

impl LostSweep {
    pub fn total(&self) -> u64 {
        self.requeued + self.failed + self.revoked
    }
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

/// A live task exactly as the queue reports it, arguments included.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLiveTask {
    pub task_id: TaskId,
    pub kind: String,
    pub worker: Option<String>,
    pub state: LiveTaskState,
    pub routing_key: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

/// Client-facing view of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub kind: String,
    pub status: TaskStatus,
    pub state: TaskState,
    pub attempts: u32,
    pub worker: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub finished_at: Option<Timestamp>,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, spec: TaskSpec) -> Result<TaskId, QueueError>;

    /// Enqueue `members` plus a join `callback` that becomes claimable
    /// exactly once, after every member has settled.
    async fn enqueue_group(
        &self,
        job_id: Option<&JobId>,
        members: Vec<TaskSpec>,
        callback: TaskSpec,
    ) -> Result<GroupReceipt, QueueError>;

    /// Reserve the next due task on one of `routing_keys`.
    async fn claim(
        &self,
        worker: &str,
        routing_keys: &[String],
    ) -> Result<Option<ClaimedTask>, QueueError>;

    /// `false` if the reservation was lost before execution started.
    async fn mark_started(&self, task_id: &str, worker: &str) -> Result<bool, QueueError>;

    async fn heartbeat(&self, task_id: &str, worker: &str) -> Result<Lease, QueueError>;

    /// Settle a task. Only the first terminal report counts.
    async fn finish(&self, task_id: &str, outcome: TaskOutcome) -> Result<FinishReceipt, QueueError>;

    /// Requeue a held task after `delay`. `false` if it is no longer held
    /// or has a pending revoke.
    async fn retry(&self, task_id: &str, delay: Duration, reason: &str) -> Result<bool, QueueError>;

    /// Recover tasks whose heartbeat is older than `lease`.
    async fn requeue_lost(&self, lease: Duration) -> Result<LostSweep, QueueError>;

    /// Revoke one task, returning the state it was in.
    async fn revoke(&self, task_id: &str, request: RevokeRequest) -> Result<TaskState, QueueError>;

    /// Revoke every non-terminal task of a job. Returns how many were hit.
    async fn revoke_job(&self, job_id: &JobId, request: RevokeRequest) -> Result<u64, QueueError>;

    async fn live_tasks(&self) -> Result<Vec<RawLiveTask>, QueueError>;

    async fn status(&self, task_id: &str) -> Result<Option<TaskStatusView>, QueueError>;

    /// Drop settled tasks older than `cutoff`.
    async fn purge_finished_before(&self, cutoff: Timestamp) -> Result<u64, QueueError>;
}

pub(crate) fn new_task_id() -> TaskId {
    uuid::Uuid::new_v4().to_string()
}
