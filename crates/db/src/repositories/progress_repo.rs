//! Repository for the `job_progress` table.
//!
//! Every write is a single statement so concurrent subtasks never lose an
//! increment.

use jokbo_core::types::Timestamp;
use sqlx::PgPool;

use crate::models::progress::ProgressRow;

/// Column list for `job_progress` queries.
const COLUMNS: &str = "job_id, total_units, completed_units, message, started_at, last_update_at";

/// Provides atomic progress counters.
pub struct ProgressRepo;

impl ProgressRepo {
    /// Create a progress record.
    ///
    /// Returns `None` if one already exists for this job.
    pub async fn init(
        pool: &PgPool,
        job_id: &str,
        total_units: i32,
        message: &str,
        started_at: Timestamp,
    ) -> Result<Option<ProgressRow>, sqlx::Error> {
        let query = format!(
            "INSERT INTO job_progress (job_id, total_units, completed_units, message, started_at) \
             VALUES ($1, $2, 0, $3, $4) \
             ON CONFLICT (job_id) DO NOTHING \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ProgressRow>(&query)
            .bind(job_id)
            .bind(total_units)
            .bind(message)
            .bind(started_at)
            .fetch_optional(pool)
            .await
    }

    /// Add `n` completed units, clamped to the total.
    ///
    /// A `NULL` message leaves the stored message unchanged. Returns `None`
    /// if the job has no progress record.
    pub async fn increment(
        pool: &PgPool,
        job_id: &str,
        n: i32,
        message: Option<&str>,
        now: Timestamp,
    ) -> Result<Option<ProgressRow>, sqlx::Error> {
        let query = format!(
            "UPDATE job_progress SET \
                completed_units = LEAST(completed_units + $2, total_units), \
                message = COALESCE($3, message), \
                last_update_at = $4 \
             WHERE job_id = $1 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ProgressRow>(&query)
            .bind(job_id)
            .bind(n)
            .bind(message)
            .bind(now)
            .fetch_optional(pool)
            .await
    }

    /// Set the completed count outright, clamped to `0..=total`.
    pub async fn set_completed(
        pool: &PgPool,
        job_id: &str,
        completed: i32,
        message: Option<&str>,
        now: Timestamp,
    ) -> Result<Option<ProgressRow>, sqlx::Error> {
        let query = format!(
            "UPDATE job_progress SET \
                completed_units = LEAST(GREATEST($2, 0), total_units), \
                message = COALESCE($3, message), \
                last_update_at = $4 \
             WHERE job_id = $1 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ProgressRow>(&query)
            .bind(job_id)
            .bind(completed)
            .bind(message)
            .bind(now)
            .fetch_optional(pool)
            .await
    }

    pub async fn find(pool: &PgPool, job_id: &str) -> Result<Option<ProgressRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM job_progress WHERE job_id = $1");
        sqlx::query_as::<_, ProgressRow>(&query)
            .bind(job_id)
            .fetch_optional(pool)
            .await
    }

    /// All progress records that are not yet finished.
    pub async fn list_unfinished(pool: &PgPool) -> Result<Vec<ProgressRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM job_progress \
             WHERE completed_units < total_units \
             ORDER BY started_at ASC"
        );
        sqlx::query_as::<_, ProgressRow>(&query)
            .fetch_all(pool)
            .await
    }

    pub async fn delete(pool: &PgPool, job_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM job_progress WHERE job_id = $1")
            .bind(job_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
