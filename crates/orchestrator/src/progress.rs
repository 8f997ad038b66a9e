//! Progress Tracker: per-job unit counters shared by every worker of a job.
//!
//! Updates are applied by the store in a single statement, so concurrent
//! increments from sibling units never lose a count.

use std::sync::Arc;

use chrono::Utc;
use jokbo_core::error::CoreError;
use jokbo_core::progress::{ProgressRecord, ProgressSnapshot, ProgressUpdate};
use jokbo_core::types::JobId;

use crate::store::JobStore;

#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn JobStore>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Start tracking a job.
    ///
    /// `Conflict` if the job already has a record; `Validation` if
    /// `total_units` is zero.
    pub async fn init(
        &self,
        job_id: &JobId,
        total_units: u32,
        message: &str,
    ) -> Result<ProgressSnapshot, CoreError> {
        let record = ProgressRecord::new(job_id.clone(), total_units, message, Utc::now())?;
        self.store.init_progress(&record).await?;
        tracing::debug!(job_id = %job_id, total_units, "Progress initialized");
        Ok(record.snapshot())
    }

    pub async fn update(
        &self,
        job_id: &JobId,
        update: ProgressUpdate,
        message: Option<&str>,
    ) -> Result<ProgressSnapshot, CoreError> {
        self.store
            .apply_progress(job_id, update, message, Utc::now())
            .await?
            .map(|record| record.snapshot())
            .ok_or_else(|| CoreError::not_found("Progress", job_id))
    }

    /// Replace the message, leaving the counters alone.
    pub async fn set_message(
        &self,
        job_id: &JobId,
        message: &str,
    ) -> Result<ProgressSnapshot, CoreError> {
        self.update(job_id, ProgressUpdate::Increment(0), Some(message))
            .await
    }

    /// Mark every unit done.
    pub async fn finalize(
        &self,
        job_id: &JobId,
        message: &str,
    ) -> Result<ProgressSnapshot, CoreError> {
        self.update(job_id, ProgressUpdate::Absolute(u32::MAX), Some(message))
            .await
    }

    pub async fn read(&self, job_id: &JobId) -> Result<ProgressSnapshot, CoreError> {
        self.store
            .get_progress(job_id)
            .await?
            .map(|record| record.snapshot())
            .ok_or_else(|| CoreError::not_found("Progress", job_id))
    }

    pub async fn delete(&self, job_id: &JobId) -> Result<bool, CoreError> {
        self.store.delete_progress(job_id).await
    }

    /// Raw records with `completed < total`, malformed ones included.
    pub async fn unfinished(&self) -> Result<Vec<ProgressRecord>, CoreError> {
        self.store.list_unfinished_progress().await
    }
}
