//! Repository for the `job_cancellations` table.

use sqlx::PgPool;

/// Provides monotonic per-job cancellation flags.
pub struct CancellationRepo;

impl CancellationRepo {
    /// Set the flag. Idempotent: the first request time is kept.
    pub async fn set(pool: &PgPool, job_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO job_cancellations (job_id) VALUES ($1) \
             ON CONFLICT (job_id) DO NOTHING",
        )
        .bind(job_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn is_set(pool: &PgPool, job_id: &str) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM job_cancellations WHERE job_id = $1)",
        )
        .bind(job_id)
        .fetch_one(pool)
        .await
    }

    /// Remove the flag. Only used when the whole job is deleted.
    pub async fn delete(pool: &PgPool, job_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM job_cancellations WHERE job_id = $1")
            .bind(job_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
