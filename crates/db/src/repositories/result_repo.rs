//! Repository for per-unit and final results.

use sqlx::PgPool;

/// Provides idempotent result recording.
pub struct ResultRepo;

impl ResultRepo {
    /// Record a unit's result. Returns `false` if one was already recorded.
    pub async fn insert_partial(
        pool: &PgPool,
        job_id: &str,
        unit_index: i32,
        payload: &serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO job_partial_results (job_id, unit_index, payload) VALUES ($1, $2, $3) \
             ON CONFLICT ON CONSTRAINT pk_job_partial_results DO NOTHING",
        )
        .bind(job_id)
        .bind(unit_index)
        .bind(payload)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find_partial(
        pool: &PgPool,
        job_id: &str,
        unit_index: i32,
    ) -> Result<Option<serde_json::Value>, sqlx::Error> {
        sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT payload FROM job_partial_results WHERE job_id = $1 AND unit_index = $2",
        )
        .bind(job_id)
        .bind(unit_index)
        .fetch_optional(pool)
        .await
    }

    /// Record the final artifact. Returns `false` if one already exists.
    pub async fn insert_final(
        pool: &PgPool,
        job_id: &str,
        payload: &serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO job_final_results (job_id, payload) VALUES ($1, $2) \
             ON CONFLICT (job_id) DO NOTHING",
        )
        .bind(job_id)
        .bind(payload)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find_final(
        pool: &PgPool,
        job_id: &str,
    ) -> Result<Option<serde_json::Value>, sqlx::Error> {
        sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT payload FROM job_final_results WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(pool)
        .await
    }

    /// Delete every result of a job. Returns the number of rows removed.
    pub async fn delete_for_job(pool: &PgPool, job_id: &str) -> Result<u64, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let partial = sqlx::query("DELETE FROM job_partial_results WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        let final_ = sqlx::query("DELETE FROM job_final_results WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(partial.rows_affected() + final_.rows_affected())
    }
}
