//! [`JobStore`] over the `jokbo-db` repositories.

use async_trait::async_trait;
use jokbo_core::error::CoreError;
use jokbo_core::job::Job;
use jokbo_core::progress::{ProgressRecord, ProgressUpdate};
use jokbo_core::types::{JobId, Timestamp};
use jokbo_db::repositories::{
    CancellationRepo, JobRepo, ProgressRepo, QuotaRepo, ResultRepo, UserJobRepo,
};
use jokbo_db::DbPool;
use serde_json::Value;

use super::JobStore;

/// Classify a sqlx error into the domain taxonomy.
///
/// - Unique violations (SQLSTATE 23505) map to `Conflict`.
/// - Everything else is a transient `StorageUnavailable`.
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> CoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            let constraint = db_err.constraint().unwrap_or("unknown");
            return CoreError::Conflict(format!(
                "Duplicate value violates unique constraint: {constraint}"
            ));
        }
    }
    tracing::error!(error = %err, "Database error");
    CoreError::StorageUnavailable(err.to_string())
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// Postgres-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: DbPool,
}

impl PgJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_job(&self, job: &Job) -> Result<(), CoreError> {
        JobRepo::create(&self.pool, job)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, CoreError> {
        JobRepo::find_by_id(&self.pool, job_id.as_str())
            .await
            .map_err(map_sqlx_error)?
            .map(|row| row.into_job())
            .transpose()
    }

    async fn put_job(&self, job: &Job) -> Result<(), CoreError> {
        JobRepo::update(&self.pool, job)
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| CoreError::not_found("Job", &job.job_id))?;
        Ok(())
    }

    async fn bind_task(&self, job_id: &JobId, task_id: &str) -> Result<(), CoreError> {
        let bound = JobRepo::bind_task(&self.pool, job_id.as_str(), task_id)
            .await
            .map_err(map_sqlx_error)?;
        if !bound {
            return Err(CoreError::not_found("Job", job_id));
        }
        Ok(())
    }

    async fn delete_job(&self, job_id: &JobId) -> Result<bool, CoreError> {
        JobRepo::delete(&self.pool, job_id.as_str())
            .await
            .map_err(map_sqlx_error)
    }

    async fn jobs_created_before(
        &self,
        cutoff: Timestamp,
        limit: usize,
    ) -> Result<Vec<JobId>, CoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let ids = JobRepo::list_created_before(&self.pool, cutoff, limit)
            .await
            .map_err(map_sqlx_error)?;
        Ok(ids.into_iter().map(JobId::from).collect())
    }

    async fn add_user_job(
        &self,
        user_id: &str,
        job_id: &JobId,
        at: Timestamp,
    ) -> Result<(), CoreError> {
        UserJobRepo::add(&self.pool, user_id, job_id.as_str(), at)
            .await
            .map_err(map_sqlx_error)
    }

    async fn user_jobs(&self, user_id: &str, limit: usize) -> Result<Vec<JobId>, CoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = UserJobRepo::list_for_user(&self.pool, user_id, limit)
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(|r| JobId::from(r.job_id)).collect())
    }

    async fn is_user_job(&self, user_id: &str, job_id: &JobId) -> Result<bool, CoreError> {
        UserJobRepo::is_member(&self.pool, user_id, job_id.as_str())
            .await
            .map_err(map_sqlx_error)
    }

    async fn remove_user_job(&self, user_id: &str, job_id: &JobId) -> Result<bool, CoreError> {
        UserJobRepo::remove(&self.pool, user_id, job_id.as_str())
            .await
            .map_err(map_sqlx_error)
    }

    async fn unindex_job(&self, job_id: &JobId) -> Result<u64, CoreError> {
        UserJobRepo::remove_job(&self.pool, job_id.as_str())
            .await
            .map_err(map_sqlx_error)
    }

    async fn prune_user_jobs_before(&self, cutoff: Timestamp) -> Result<u64, CoreError> {
        UserJobRepo::prune_before(&self.pool, cutoff)
            .await
            .map_err(map_sqlx_error)
    }

    async fn init_progress(&self, record: &ProgressRecord) -> Result<(), CoreError> {
        let created = ProgressRepo::init(
            &self.pool,
            record.job_id.as_str(),
            to_i32(record.total_units),
            &record.message,
            record.started_at,
        )
        .await
        .map_err(map_sqlx_error)?;
        match created {
            Some(_) => Ok(()),
            None => Err(CoreError::Conflict(format!(
                "Progress for job {} is already initialized",
                record.job_id
            ))),
        }
    }

    async fn apply_progress(
        &self,
        job_id: &JobId,
        update: ProgressUpdate,
        message: Option<&str>,
        now: Timestamp,
    ) -> Result<Option<ProgressRecord>, CoreError> {
        let row = match update {
            ProgressUpdate::Increment(n) => {
                ProgressRepo::increment(&self.pool, job_id.as_str(), to_i32(n), message, now).await
            }
            ProgressUpdate::Absolute(n) => {
                ProgressRepo::set_completed(&self.pool, job_id.as_str(), to_i32(n), message, now)
                    .await
            }
        }
        .map_err(map_sqlx_error)?;
        Ok(row.map(ProgressRecord::from))
    }

    async fn get_progress(&self, job_id: &JobId) -> Result<Option<ProgressRecord>, CoreError> {
        let row = ProgressRepo::find(&self.pool, job_id.as_str())
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(ProgressRecord::from))
    }

    async fn list_unfinished_progress(&self) -> Result<Vec<ProgressRecord>, CoreError> {
        let rows = ProgressRepo::list_unfinished(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(ProgressRecord::from).collect())
    }

    async fn delete_progress(&self, job_id: &JobId) -> Result<bool, CoreError> {
        ProgressRepo::delete(&self.pool, job_id.as_str())
            .await
            .map_err(map_sqlx_error)
    }

    async fn set_cancelled(&self, job_id: &JobId) -> Result<(), CoreError> {
        CancellationRepo::set(&self.pool, job_id.as_str())
            .await
            .map_err(map_sqlx_error)
    }

    async fn is_cancelled(&self, job_id: &JobId) -> Result<bool, CoreError> {
        CancellationRepo::is_set(&self.pool, job_id.as_str())
            .await
            .map_err(map_sqlx_error)
    }

    async fn clear_cancelled(&self, job_id: &JobId) -> Result<bool, CoreError> {
        CancellationRepo::delete(&self.pool, job_id.as_str())
            .await
            .map_err(map_sqlx_error)
    }

    async fn get_balance(&self, user_id: &str) -> Result<Option<i64>, CoreError> {
        QuotaRepo::get(&self.pool, user_id)
            .await
            .map_err(map_sqlx_error)
    }

    async fn set_balance(&self, user_id: &str, balance: i64) -> Result<(), CoreError> {
        QuotaRepo::set(&self.pool, user_id, balance)
            .await
            .map_err(map_sqlx_error)
    }

    async fn add_balance(&self, user_id: &str, delta: i64) -> Result<i64, CoreError> {
        QuotaRepo::add(&self.pool, user_id, delta)
            .await
            .map_err(map_sqlx_error)
    }

    async fn record_partial(
        &self,
        job_id: &JobId,
        unit_index: u32,
        value: &Value,
    ) -> Result<bool, CoreError> {
        ResultRepo::insert_partial(&self.pool, job_id.as_str(), to_i32(unit_index), value)
            .await
            .map_err(map_sqlx_error)
    }

    async fn get_partial(&self, job_id: &JobId, unit_index: u32) -> Result<Option<Value>, CoreError> {
        ResultRepo::find_partial(&self.pool, job_id.as_str(), to_i32(unit_index))
            .await
            .map_err(map_sqlx_error)
    }

    async fn record_final(&self, job_id: &JobId, value: &Value) -> Result<bool, CoreError> {
        ResultRepo::insert_final(&self.pool, job_id.as_str(), value)
            .await
            .map_err(map_sqlx_error)
    }

    async fn get_final(&self, job_id: &JobId) -> Result<Option<Value>, CoreError> {
        ResultRepo::find_final(&self.pool, job_id.as_str())
            .await
            .map_err(map_sqlx_error)
    }

    async fn delete_results(&self, job_id: &JobId) -> Result<u64, CoreError> {
        ResultRepo::delete_for_job(&self.pool, job_id.as_str())
            .await
            .map_err(map_sqlx_error)
    }
}
