use jokbo_core::types::Timestamp;
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `user_jobs` index.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UserJobRow {
    pub user_id: String,
    pub job_id: String,
    pub created_at: Timestamp,
}
