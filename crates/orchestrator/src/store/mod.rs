//! Persistent job state behind a single trait.
//!
//! [`JobStore`] is the only path to job records, progress, cancellation
//! flags, the per-user index, quota balances and results. Every operation is
//! a single atomic step on the backing store; there is no cached
//! read-modify-write anywhere above this seam.

use async_trait::async_trait;
use jokbo_core::error::CoreError;
use jokbo_core::job::Job;
use jokbo_core::progress::{ProgressRecord, ProgressUpdate};
use jokbo_core::types::{JobId, Timestamp};
use serde_json::Value;

pub mod memory;
pub mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

#[async_trait]
pub trait JobStore: Send + Sync {
    // -- Jobs --

    /// Insert a job. `Conflict` if the id is taken.
    async fn create_job(&self, job: &Job) -> Result<(), CoreError>;
    async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, CoreError>;
    /// Overwrite an existing job. `NotFound` if absent.
    async fn put_job(&self, job: &Job) -> Result<(), CoreError>;
    /// Record the dispatched task id. `NotFound` if the job is absent.
    async fn bind_task(&self, job_id: &JobId, task_id: &str) -> Result<(), CoreError>;
    async fn delete_job(&self, job_id: &JobId) -> Result<bool, CoreError>;
    /// Oldest first.
    async fn jobs_created_before(
        &self,
        cutoff: Timestamp,
        limit: usize,
    ) -> Result<Vec<JobId>, CoreError>;

    // -- Per-user index --

    async fn add_user_job(
        &self,
        user_id: &str,
        job_id: &JobId,
        at: Timestamp,
    ) -> Result<(), CoreError>;
    /// Most recent first.
    async fn user_jobs(&self, user_id: &str, limit: usize) -> Result<Vec<JobId>, CoreError>;
    async fn is_user_job(&self, user_id: &str, job_id: &JobId) -> Result<bool, CoreError>;
    async fn remove_user_job(&self, user_id: &str, job_id: &JobId) -> Result<bool, CoreError>;
    /// Drop a job from every user's index.
    async fn unindex_job(&self, job_id: &JobId) -> Result<u64, CoreError>;
    async fn prune_user_jobs_before(&self, cutoff: Timestamp) -> Result<u64, CoreError>;

    // -- Progress --

    /// `Conflict` if a record already exists.
    async fn init_progress(&self, record: &ProgressRecord) -> Result<(), CoreError>;
    /// Apply atomically on the store. `None` if uninitialized.
    async fn apply_progress(
        &self,
        job_id: &JobId,
        update: ProgressUpdate,
        message: Option<&str>,
        now: Timestamp,
    ) -> Result<Option<ProgressRecord>, CoreError>;
    async fn get_progress(&self, job_id: &JobId) -> Result<Option<ProgressRecord>, CoreError>;
    /// Records with `completed < total`.
    async fn list_unfinished_progress(&self) -> Result<Vec<ProgressRecord>, CoreError>;
    async fn delete_progress(&self, job_id: &JobId) -> Result<bool, CoreError>;

    // -- Cancellation --

    async fn set_cancelled(&self, job_id: &JobId) -> Result<(), CoreError>;
    async fn is_cancelled(&self, job_id: &JobId) -> Result<bool, CoreError>;
    /// Only called when the whole job is deleted.
    async fn clear_cancelled(&self, job_id: &JobId) -> Result<bool, CoreError>;

    // -- Quota --

    async fn get_balance(&self, user_id: &str) -> Result<Option<i64>, CoreError>;
    async fn set_balance(&self, user_id: &str, balance: i64) -> Result<(), CoreError>;
    /// Atomic increment; a missing balance counts as zero.
    async fn add_balance(&self, user_id: &str, delta: i64) -> Result<i64, CoreError>;

    // -- Results --

    /// `false` if this unit already has a result.
    async fn record_partial(
        &self,
        job_id: &JobId,
        unit_index: u32,
        value: &Value,
    ) -> Result<bool, CoreError>;
    async fn get_partial(&self, job_id: &JobId, unit_index: u32) -> Result<Option<Value>, CoreError>;
    /// `false` if the job already has a final artifact.
    async fn record_final(&self, job_id: &JobId, value: &Value) -> Result<bool, CoreError>;
    async fn get_final(&self, job_id: &JobId) -> Result<Option<Value>, CoreError>;
    async fn delete_results(&self, job_id: &JobId) -> Result<u64, CoreError>;
}
