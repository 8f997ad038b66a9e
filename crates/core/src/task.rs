//! Task kinds, queue states, and per-unit time budgets.
//!
//! Shared by the queue backends (db crate and in-memory), the dispatcher,
//! and the worker runtime.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::mode::AnalysisMode;

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

/// Routing key for analysis work.
pub const QUEUE_ANALYSIS: &str = "analysis";

/// Routing key for everything else.
pub const QUEUE_DEFAULT: &str = "default";

// ---------------------------------------------------------------------------
// Task kinds
// ---------------------------------------------------------------------------

/// Every unit of work the orchestrator knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    RunJokboAnalysis,
    RunLessonAnalysis,
    GeneratePartialJokbo,
    RunExamOnly,
    /// One member of a batch fan-out.
    BatchAnalyzeSingle,
    /// Join continuation of a batch.
    AggregateBatch,
}

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        TaskKind::RunJokboAnalysis,
        TaskKind::RunLessonAnalysis,
        TaskKind::GeneratePartialJokbo,
        TaskKind::RunExamOnly,
        TaskKind::BatchAnalyzeSingle,
        TaskKind::AggregateBatch,
    ];

    /// Registered task name as stored in the queue.
    pub fn name(self) -> &'static str {
        match self {
            TaskKind::RunJokboAnalysis => "tasks.run_jokbo_analysis",
            TaskKind::RunLessonAnalysis => "tasks.run_lesson_analysis",
            TaskKind::GeneratePartialJokbo => "tasks.generate_partial_jokbo",
            TaskKind::RunExamOnly => "tasks.run_exam_only",
            TaskKind::BatchAnalyzeSingle => "tasks.batch_analyze_single",
            TaskKind::AggregateBatch => "tasks.aggregate_batch",
        }
    }

    /// The single-task kind that runs a non-batch job of `mode`.
    ///
    /// Batch jobs are dispatched as a group and have no single kind.
    pub fn for_single(mode: AnalysisMode) -> Result<TaskKind, CoreError> {
        match mode {
            AnalysisMode::JokboCentric => Ok(TaskKind::RunJokboAnalysis),
            AnalysisMode::LessonCentric => Ok(TaskKind::RunLessonAnalysis),
            AnalysisMode::PartialJokbo => Ok(TaskKind::GeneratePartialJokbo),
            AnalysisMode::ExamOnly => Ok(TaskKind::RunExamOnly),
            AnalysisMode::Batch => Err(CoreError::Validation(
                "Batch jobs must be dispatched as a group".to_string(),
            )),
        }
    }

    pub fn routing_key(self) -> &'static str {
        QUEUE_ANALYSIS
    }

    /// Default two-tier time budget for one execution of this kind.
    pub fn default_limits(self) -> TimeLimits {
        match self {
            TaskKind::RunJokboAnalysis | TaskKind::RunLessonAnalysis => TimeLimits::LONG_ANALYSIS,
            _ => TimeLimits::DEFAULT,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TaskKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| CoreError::Validation(format!("Unknown task kind: \"{s}\"")))
    }
}

// ---------------------------------------------------------------------------
// Time limits
// ---------------------------------------------------------------------------

/// Two-tier per-unit time budget.
///
/// Reaching `soft` cancels the unit's token so it can stop at its next
/// checkpoint. Reaching `hard` aborts the execution outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLimits {
    pub soft: Duration,
    pub hard: Duration,
}

impl TimeLimits {
    pub const DEFAULT: TimeLimits = TimeLimits {
        soft: Duration::from_secs(3300),
        hard: Duration::from_secs(3600),
    };

    pub const LONG_ANALYSIS: TimeLimits = TimeLimits {
        soft: Duration::from_secs(6900),
        hard: Duration::from_secs(7200),
    };

    /// Build a budget, requiring `hard` to be strictly above `soft`.
    pub fn new(soft: Duration, hard: Duration) -> Result<Self, CoreError> {
        if soft.is_zero() {
            return Err(CoreError::Validation(
                "Soft time limit must be positive".to_string(),
            ));
        }
        if hard <= soft {
            return Err(CoreError::Validation(format!(
                "Hard time limit ({}s) must exceed soft limit ({}s)",
                hard.as_secs_f64(),
                soft.as_secs_f64()
            )));
        }
        Ok(Self { soft, hard })
    }
}

// ---------------------------------------------------------------------------
// Queue task states
// ---------------------------------------------------------------------------

/// Lifecycle of a task inside the queue.
///
/// `Waiting` is only used for join continuations that have not fired yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Waiting,
    Scheduled,
    Reserved,
    Active,
    Succeeded,
    Failed,
    Revoked,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Waiting => "waiting",
            TaskState::Scheduled => "scheduled",
            TaskState::Reserved => "reserved",
            TaskState::Active => "active",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Revoked => "revoked",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Revoked
        )
    }

    /// States the broker reports as in flight.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            TaskState::Scheduled | TaskState::Reserved | TaskState::Active
        )
    }

    /// Client-facing status label. `attempts > 0` on a scheduled task
    /// means it is waiting for a retry.
    pub fn status(self, attempts: u32) -> TaskStatus {
        match self {
            TaskState::Waiting | TaskState::Reserved => TaskStatus::Pending,
            TaskState::Scheduled if attempts > 0 => TaskStatus::Retry,
            TaskState::Scheduled => TaskStatus::Pending,
            TaskState::Active => TaskStatus::Started,
            TaskState::Succeeded => TaskStatus::Success,
            TaskState::Failed => TaskStatus::Failure,
            TaskState::Revoked => TaskStatus::Revoked,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TaskState::Waiting),
            "scheduled" => Ok(TaskState::Scheduled),
            "reserved" => Ok(TaskState::Reserved),
            "active" => Ok(TaskState::Active),
            "succeeded" => Ok(TaskState::Succeeded),
            "failed" => Ok(TaskState::Failed),
            "revoked" => Ok(TaskState::Revoked),
            other => Err(CoreError::Validation(format!("Unknown task state: \"{other}\""))),
        }
    }
}

/// Status labels exposed to clients polling a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Started,
    Retry,
    Success,
    Failure,
    Revoked,
}

impl TaskStatus {
    /// Task is still expected to make progress.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Started | TaskStatus::Retry
        )
    }
}

// ---------------------------------------------------------------------------
// Revocation
// ---------------------------------------------------------------------------

/// Signal delivered to the execution of a forcefully revoked task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RevokeSignal {
    /// Cancel the unit's token, then abort after a grace period.
    #[default]
    Sigterm,
    /// Abort immediately.
    Sigkill,
}

impl RevokeSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            RevokeSignal::Sigterm => "SIGTERM",
            RevokeSignal::Sigkill => "SIGKILL",
        }
    }
}

impl FromStr for RevokeSignal {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SIGTERM" | "TERM" => Ok(RevokeSignal::Sigterm),
            "SIGKILL" | "KILL" => Ok(RevokeSignal::Sigkill),
            other => Err(CoreError::Validation(format!("Unsupported signal: \"{other}\""))),
        }
    }
}

/// A pending revoke request as recorded on a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeRequest {
    /// Terminate a running execution instead of only skipping queued work.
    pub terminate: bool,
    pub signal: RevokeSignal,
}

impl RevokeRequest {
    pub fn forceful(signal: RevokeSignal) -> Self {
        Self {
            terminate: true,
            signal,
        }
    }

    pub fn cooperative() -> Self {
        Self {
            terminate: false,
            signal: RevokeSignal::Sigterm,
        }
    }
}
