//! Row models for per-unit and final results.

use jokbo_core::types::Timestamp;
use serde::Serialize;
use sqlx::FromRow;

/// A row from `job_partial_results`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PartialResultRow {
    pub job_id: String,
    pub unit_index: i32,
    pub payload: serde_json::Value,
    pub created_at: Timestamp,
}

/// A row from `job_final_results`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct FinalResultRow {
    pub job_id: String,
    pub payload: serde_json::Value,
    pub created_at: Timestamp,
}
