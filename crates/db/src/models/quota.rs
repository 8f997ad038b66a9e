use jokbo_core::types::Timestamp;
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `user_quotas` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct QuotaRow {
    pub user_id: String,
    pub balance: i64,
    pub updated_at: Timestamp,
}
