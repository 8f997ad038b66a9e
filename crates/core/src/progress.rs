//! Progress records and the arithmetic shared by every store backend.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{JobId, Timestamp};

/// Message written to a job's progress when cancellation is requested.
pub const MSG_CANCEL_REQUESTED: &str = "Cancellation requested";

/// Message written when the final artifact has been recorded.
pub const MSG_COMPLETED: &str = "Completed";

/// Per-job completion counters.
///
/// Invariant: `1 <= total_units` and `completed_units <= total_units`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub job_id: JobId,
    pub total_units: u32,
    pub completed_units: u32,
    pub message: String,
    pub started_at: Timestamp,
    /// `None` until the first update after initialization.
    pub last_update_at: Option<Timestamp>,
}

impl ProgressRecord {
    pub fn new(
        job_id: JobId,
        total_units: u32,
        message: impl Into<String>,
        now: Timestamp,
    ) -> Result<Self, CoreError> {
        if total_units == 0 {
            return Err(CoreError::Validation(
                "total_units must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            job_id,
            total_units,
            completed_units: 0,
            message: message.into(),
            started_at: now,
            last_update_at: None,
        })
    }

    /// Records read back from a store may be malformed or half-expired.
    pub fn is_well_formed(&self) -> bool {
        self.total_units >= 1 && self.completed_units <= self.total_units
    }

    pub fn is_finished(&self) -> bool {
        self.completed_units >= self.total_units
    }

    pub fn percent(&self) -> u8 {
        percent(self.completed_units, self.total_units)
    }

    /// Apply an update in place. Mirrors the atomic SQL update so that the
    /// in-memory backend and Postgres agree on clamping.
    pub fn apply(&mut self, update: ProgressUpdate, message: Option<&str>, now: Timestamp) {
        self.completed_units = update.resolve(self.completed_units, self.total_units);
        if let Some(message) = message {
            self.message = message.to_string();
        }
        self.last_update_at = Some(now);
    }

    /// Last moment this job was seen making progress.
    pub fn last_activity(&self) -> Timestamp {
        self.last_update_at.unwrap_or(self.started_at)
    }

    /// Whole seconds since the last activity, never negative.
    pub fn idle_seconds(&self, now: Timestamp) -> i64 {
        (now - self.last_activity()).num_seconds().max(0)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            job_id: self.job_id.clone(),
            percent: self.percent(),
            completed: self.completed_units,
            total: self.total_units,
            message: self.message.clone(),
            started_at: self.started_at,
            last_update_at: self.last_update_at,
        }
    }
}

/// A progress change reported by a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressUpdate {
    /// Add this many completed units.
    Increment(u32),
    /// Set the completed count outright.
    Absolute(u32),
}

impl ProgressUpdate {
    /// New completed count, clamped to `0..=total`.
    pub fn resolve(self, completed: u32, total: u32) -> u32 {
        match self {
            ProgressUpdate::Increment(n) => completed.saturating_add(n).min(total),
            ProgressUpdate::Absolute(n) => n.min(total),
        }
    }
}

/// Read view of a job's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: JobId,
    pub percent: u8,
    pub completed: u32,
    pub total: u32,
    pub message: String,
    pub started_at: Timestamp,
    pub last_update_at: Option<Timestamp>,
}

impl ProgressSnapshot {
    pub fn is_finished(&self) -> bool {
        self.completed >= self.total
    }
}

/// `clamp(floor(100 * completed / total), 0, 100)`.
pub fn percent(completed: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (u64::from(completed) * 100) / u64::from(total);
    pct.min(100) as u8
}

/// A job whose progress has not advanced within the stall threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StalledJob {
    pub job_id: JobId,
    pub completed: u32,
    pub total: u32,
    pub idle_seconds: i64,
    pub message: String,
}

/// Classify records as stalled.
///
/// Finished and malformed records are skipped, never reported.
pub fn find_stalled<'a, I>(records: I, now: Timestamp, threshold: chrono::Duration) -> Vec<StalledJob>
where
    I: IntoIterator<Item = &'a ProgressRecord>,
{
    let threshold_secs = threshold.num_seconds();
    records
        .into_iter()
        .filter(|r| r.is_well_formed() && !r.is_finished())
        .filter_map(|r| {
            let idle_seconds = r.idle_seconds(now);
            (idle_seconds >= threshold_secs).then(|| StalledJob {
                job_id: r.job_id.clone(),
                completed: r.completed_units,
                total: r.total_units,
                idle_seconds,
                message: r.message.clone(),
            })
        })
        .collect()
}
