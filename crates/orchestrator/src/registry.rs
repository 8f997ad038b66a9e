//! Job Registry: the authoritative record of every job.

use std::sync::Arc;

use chrono::Utc;
use jokbo_core::error::CoreError;
use jokbo_core::job::Job;
use jokbo_core::types::{JobId, Timestamp, UserId};

use crate::store::JobStore;

#[derive(Clone)]
pub struct JobRegistry {
    store: Arc<dyn JobStore>,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Persist a new job. `Conflict` if the id already exists.
    pub async fn create(&self, job: &Job) -> Result<(), CoreError> {
        self.store.create_job(job).await?;
        tracing::info!(job_id = %job.job_id, mode = %job.mode, "Job created");
        Ok(())
    }

    pub async fn find(&self, job_id: &JobId) -> Result<Option<Job>, CoreError> {
        self.store.get_job(job_id).await
    }

    pub async fn get_metadata(&self, job_id: &JobId) -> Result<Job, CoreError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| CoreError::not_found("Job", job_id))
    }

    /// Read-modify-write of a job record.
    ///
    /// Not atomic across concurrent writers; `f` must be idempotent.
    pub async fn update_metadata<F>(&self, job_id: &JobId, f: F) -> Result<Job, CoreError>
    where
        F: FnOnce(&mut Job),
    {
        let mut job = self.get_metadata(job_id).await?;
        f(&mut job);
        self.store.put_job(&job).await?;
        Ok(job)
    }

    pub async fn bind_task(&self, job_id: &JobId, task_id: &str) -> Result<(), CoreError> {
        self.store.bind_task(job_id, task_id).await?;
        tracing::debug!(job_id = %job_id, task_id, "Task bound to job");
        Ok(())
    }

    /// The owner as recorded on the job itself, not the per-user index.
    pub async fn get_owner(&self, job_id: &JobId) -> Result<Option<UserId>, CoreError> {
        Ok(self.get_metadata(job_id).await?.owner_user_id)
    }

    // -- Per-user index --

    pub async fn add_user_job(&self, user_id: &str, job_id: &JobId) -> Result<(), CoreError> {
        self.store.add_user_job(user_id, job_id, Utc::now()).await
    }

    /// Most recent first.
    pub async fn get_user_jobs(&self, user_id: &str, limit: usize) -> Result<Vec<JobId>, CoreError> {
        self.store.user_jobs(user_id, limit).await
    }

    pub async fn is_user_job(&self, user_id: &str, job_id: &JobId) -> Result<bool, CoreError> {
        self.store.is_user_job(user_id, job_id).await
    }

    pub async fn remove_user_job(&self, user_id: &str, job_id: &JobId) -> Result<bool, CoreError> {
        self.store.remove_user_job(user_id, job_id).await
    }

    // -- Deletion and retention --

    /// Remove every trace of a job: results, progress, cancellation flag,
    /// index entries and the record itself.
    ///
    /// Results go first so a failure part-way never leaves results without
    /// their job.
    pub async fn delete_all(&self, job_id: &JobId) -> Result<(), CoreError> {
        let results = self.store.delete_results(job_id).await?;
        self.store.delete_progress(job_id).await?;
        self.store.clear_cancelled(job_id).await?;
        self.store.unindex_job(job_id).await?;
        let existed = self.store.delete_job(job_id).await?;
        tracing::info!(job_id = %job_id, results, existed, "Job deleted");
        Ok(())
    }

    /// Oldest first.
    pub async fn jobs_created_before(
        &self,
        cutoff: Timestamp,
        limit: usize,
    ) -> Result<Vec<JobId>, CoreError> {
        self.store.jobs_created_before(cutoff, limit).await
    }

    /// Drop per-user index entries older than `cutoff`, independently of the
    /// jobs they point to.
    pub async fn prune_user_index(&self, cutoff: Timestamp) -> Result<u64, CoreError> {
        self.store.prune_user_jobs_before(cutoff).await
    }
}
