//! Row models for `job_progress` and `job_cancellations`.

use jokbo_core::progress::ProgressRecord;
use jokbo_core::types::{JobId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `job_progress` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ProgressRow {
    pub job_id: String,
    pub total_units: i32,
    pub completed_units: i32,
    pub message: String,
    pub started_at: Timestamp,
    pub last_update_at: Option<Timestamp>,
}

impl From<ProgressRow> for ProgressRecord {
    /// Negative counters map to zero, which leaves the record malformed
    /// (`total_units == 0`) rather than failing the read.
    fn from(row: ProgressRow) -> Self {
        ProgressRecord {
            job_id: JobId::from(row.job_id),
            total_units: u32::try_from(row.total_units).unwrap_or(0),
            completed_units: u32::try_from(row.completed_units).unwrap_or(0),
            message: row.message,
            started_at: row.started_at,
            last_update_at: row.last_update_at,
        }
    }
}

/// A row from the `job_cancellations` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CancellationRow {
    pub job_id: String,
    pub requested_at: Timestamp,
}
