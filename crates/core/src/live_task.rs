//! Live task views reported by the queue, and the job-id heuristic used to
//! correlate them with registry state.
//!
//! The queue knows nothing about jobs. A live task is linked to a job only by
//! peeking at its arguments, which is why the result is advisory.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{JobId, TaskId};

/// Identifier-looking strings: UUIDs and similar opaque tokens.
const JOB_ID_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9_-]{7,63}$";

static JOB_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(JOB_ID_PATTERN).expect("valid regex"));

/// In-flight states as seen by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveTaskState {
    /// Executing on a worker.
    Active,
    /// Prefetched by a worker but not started.
    Reserved,
    /// Waiting in the queue, possibly with a future ETA.
    Scheduled,
}

impl LiveTaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            LiveTaskState::Active => "active",
            LiveTaskState::Reserved => "reserved",
            LiveTaskState::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for LiveTaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic view of a task the queue reports as in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveTaskView {
    pub task_id: TaskId,
    /// Name of the worker holding the task, `None` while still queued.
    pub worker: Option<String>,
    pub state: LiveTaskState,
    pub embedded_job_id: Option<JobId>,
    pub routing_key: String,
}

/// Best-effort extraction of the job a task belongs to.
///
/// Takes the first positional argument when it looks like an identifier,
/// otherwise the `job_id` keyword argument.
pub fn extract_embedded_job_id(args: &[Value], kwargs: &Map<String, Value>) -> Option<JobId> {
    args.first()
        .and_then(identifier_like)
        .or_else(|| kwargs.get("job_id").and_then(identifier_like))
        .map(JobId::from)
}

fn identifier_like(value: &Value) -> Option<&str> {
    value.as_str().filter(|s| JOB_ID_RE.is_match(s))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn kwargs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn first_positional_uuid_wins() {
        let id = "7f0c6a8e-1b2d-4c3e-9f10-2a3b4c5d6e7f";
        let args = vec![json!(id), json!("jokbo-centric")];
        let found = extract_embedded_job_id(&args, &kwargs(json!({ "job_id": "other-job-id" })));
        assert_eq!(found, Some(JobId::from(id)));
    }

    #[test]
    fn falls_back_to_job_id_kwarg() {
        let args = vec![json!(42), json!("x")];
        let found = extract_embedded_job_id(&args, &kwargs(json!({ "job_id": "abcdef123456" })));
        assert_eq!(found, Some(JobId::from("abcdef123456")));
    }

    #[test]
    fn short_or_spaced_strings_are_not_identifiers() {
        let args = vec![json!("short")];
        assert_eq!(extract_embedded_job_id(&args, &Map::new()), None);

        let args = vec![json!("has a space in it")];
        assert_eq!(extract_embedded_job_id(&args, &Map::new()), None);
    }

    #[test]
    fn no_args_and_no_kwarg_yields_none() {
        assert_eq!(extract_embedded_job_id(&[], &Map::new()), None);
        let found = extract_embedded_job_id(&[], &kwargs(json!({ "job_id": 17 })));
        assert_eq!(found, None);
    }

    #[test]
    fn overlong_strings_are_rejected() {
        let long = "a".repeat(65);
        assert_eq!(extract_embedded_job_id(&[json!(long)], &Map::new()), None);
        let max = "a".repeat(64);
        assert!(extract_embedded_job_id(&[json!(max)], &Map::new()).is_some());
    }
}
