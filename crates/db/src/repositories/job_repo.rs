//! Repository for the `jobs` table.

use jokbo_core::job::Job;
use jokbo_core::types::Timestamp;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::models::job::JobRow;

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    job_id, mode, owner_user_id, input_refs, model_tier, multi_api, \
    min_relevance, is_preflight, is_batch, batch_unit_mode, estimated_units, \
    bound_task_id, created_at, updated_at";

fn estimated_units(job: &Job) -> Option<i32> {
    job.estimated_units
        .map(|n| i32::try_from(n).unwrap_or(i32::MAX))
}

/// Provides persistence for job records.
pub struct JobRepo;

impl JobRepo {
    /// Insert a new job. A duplicate `job_id` surfaces as a unique violation.
    pub async fn create(pool: &PgPool, job: &Job) -> Result<JobRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO jobs \
                (job_id, mode, owner_user_id, input_refs, model_tier, multi_api, \
                 min_relevance, is_preflight, is_batch, batch_unit_mode, estimated_units, \
                 bound_task_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(job.job_id.as_str())
            .bind(job.mode.as_str())
            .bind(&job.owner_user_id)
            .bind(Json(&job.input_refs))
            .bind(job.model_tier.as_str())
            .bind(job.multi_api)
            .bind(job.min_relevance)
            .bind(job.is_preflight)
            .bind(job.is_batch)
            .bind(job.batch_unit_mode.map(|m| m.as_str()))
            .bind(estimated_units(job))
            .bind(&job.bound_task_id)
            .bind(job.created_at)
            .fetch_one(pool)
            .await
    }

    /// Find a job by id.
    pub async fn find_by_id(pool: &PgPool, job_id: &str) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE job_id = $1");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(job_id)
            .fetch_optional(pool)
            .await
    }

    /// Overwrite the mutable fields of an existing job.
    ///
    /// Returns `None` if the job does not exist. `job_id` and `created_at`
    /// are never changed.
    pub async fn update(pool: &PgPool, job: &Job) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs SET \
                mode = $2, owner_user_id = $3, input_refs = $4, model_tier = $5, \
                multi_api = $6, min_relevance = $7, is_preflight = $8, is_batch = $9, \
                batch_unit_mode = $10, estimated_units = $11, bound_task_id = $12, \
                updated_at = NOW() \
             WHERE job_id = $1 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(job.job_id.as_str())
            .bind(job.mode.as_str())
            .bind(&job.owner_user_id)
            .bind(Json(&job.input_refs))
            .bind(job.model_tier.as_str())
            .bind(job.multi_api)
            .bind(job.min_relevance)
            .bind(job.is_preflight)
            .bind(job.is_batch)
            .bind(job.batch_unit_mode.map(|m| m.as_str()))
            .bind(estimated_units(job))
            .bind(&job.bound_task_id)
            .fetch_optional(pool)
            .await
    }

    /// Record the task a job was dispatched as.
    ///
    /// Returns `false` if the job does not exist.
    pub async fn bind_task(pool: &PgPool, job_id: &str, task_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs SET bound_task_id = $2, updated_at = NOW() WHERE job_id = $1",
        )
        .bind(job_id)
        .bind(task_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a job record. Returns `true` if a row was removed.
    pub async fn delete(pool: &PgPool, job_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Ids of jobs created before `cutoff`, oldest first.
    pub async fn list_created_before(
        pool: &PgPool,
        cutoff: Timestamp,
        limit: i64,
    ) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>(
            "SELECT job_id FROM jobs WHERE created_at < $1 ORDER BY created_at ASC LIMIT $2",
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(pool)
        .await
    }
}
