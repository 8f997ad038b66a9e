//! Row models for the Postgres-backed task queue.

use jokbo_core::types::Timestamp;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row from the `queue_tasks` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct QueueTaskRow {
    pub task_id: String,
    pub kind: String,
    pub job_id: Option<String>,
    pub args: serde_json::Value,
    pub kwargs: serde_json::Value,
    pub routing_key: String,
    pub state: String,
    pub worker: Option<String>,
    pub attempts: i32,
    pub max_retries: i32,
    pub eta: Option<Timestamp>,
    pub soft_limit_secs: i32,
    pub hard_limit_secs: i32,
    pub group_id: Option<String>,
    pub member_index: Option<i32>,
    pub revoke_requested: bool,
    pub revoke_terminate: bool,
    pub revoke_signal: Option<String>,
    pub heartbeat_at: Option<Timestamp>,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: Timestamp,
}

/// A freshly reserved task. For a group's join continuation, `members`
/// holds the group's member rows as of the claim.
#[derive(Debug, Clone)]
pub struct ClaimedRow {
    pub task: QueueTaskRow,
    pub members: Vec<QueueTaskRow>,
}

/// Insert DTO for a queued task.
#[derive(Debug, Clone, Deserialize)]
pub struct NewQueueTask {
    pub task_id: String,
    pub kind: String,
    pub job_id: Option<String>,
    pub args: serde_json::Value,
    pub kwargs: serde_json::Value,
    pub routing_key: String,
    pub max_retries: i32,
    pub soft_limit_secs: i32,
    pub hard_limit_secs: i32,
}

/// A row from the `queue_groups` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct QueueGroupRow {
    pub group_id: String,
    pub job_id: Option<String>,
    pub total: i32,
    pub terminal_count: i32,
    pub callback_task_id: String,
    pub fired_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

/// Revoke request columns returned by a heartbeat.
#[derive(Debug, Clone, FromRow)]
pub struct HeartbeatRow {
    pub revoke_requested: bool,
    pub revoke_terminate: bool,
    pub revoke_signal: Option<String>,
}

/// Result of moving a task to a terminal state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettleOutcome {
    /// `false` when the task was already terminal (duplicate report).
    pub transitioned: bool,
    /// Set when this transition released the group's join continuation.
    pub fired_callback: Option<String>,
}

/// Result of a lost-task sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LostSweep {
    pub requeued: u64,
    pub failed: u64,
    pub revoked: u64,
}
