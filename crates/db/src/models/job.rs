//! Row model for the `jobs` table.

use jokbo_core::error::CoreError;
use jokbo_core::job::{InputRefs, Job};
use jokbo_core::mode::{AnalysisMode, ModelTier};
use jokbo_core::types::{JobId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobRow {
    pub job_id: String,
    pub mode: String,
    pub owner_user_id: Option<String>,
    pub input_refs: serde_json::Value,
    pub model_tier: String,
    pub multi_api: bool,
    pub min_relevance: Option<i32>,
    pub is_preflight: bool,
    pub is_batch: bool,
    pub batch_unit_mode: Option<String>,
    pub estimated_units: Option<i32>,
    pub bound_task_id: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl JobRow {
    /// Parse the stored tags back into the domain record.
    ///
    /// Fails with `Internal` on a row that could not have been written by
    /// [`JobRepo::create`](crate::repositories::JobRepo::create).
    pub fn into_job(self) -> Result<Job, CoreError> {
        let corrupt = |what: &str, e: &dyn std::fmt::Display| {
            CoreError::Internal(format!("Corrupt job row {}: {what}: {e}", self.job_id))
        };
        let mode = self
            .mode
            .parse::<AnalysisMode>()
            .map_err(|e| corrupt("mode", &e))?;
        let model_tier = self
            .model_tier
            .parse::<ModelTier>()
            .map_err(|e| corrupt("model_tier", &e))?;
        let batch_unit_mode = self
            .batch_unit_mode
            .as_deref()
            .map(str::parse::<AnalysisMode>)
            .transpose()
            .map_err(|e| corrupt("batch_unit_mode", &e))?;
        let input_refs: InputRefs = serde_json::from_value(self.input_refs.clone())
            .map_err(|e| corrupt("input_refs", &e))?;

        Ok(Job {
            job_id: JobId::from(self.job_id),
            mode,
            owner_user_id: self.owner_user_id,
            input_refs,
            model_tier,
            multi_api: self.multi_api,
            min_relevance: self.min_relevance,
            is_preflight: self.is_preflight,
            is_batch: self.is_batch,
            batch_unit_mode,
            estimated_units: self.estimated_units.and_then(|n| u32::try_from(n).ok()),
            bound_task_id: self.bound_task_id,
            created_at: self.created_at,
        })
    }
}
