//! Repository for the `user_jobs` index.

use jokbo_core::types::Timestamp;
use sqlx::PgPool;

use crate::models::user_job::UserJobRow;

/// Provides the per-user job index.
pub struct UserJobRepo;

impl UserJobRepo {
    /// Add a job to a user's index. Re-adding is a no-op.
    pub async fn add(
        pool: &PgPool,
        user_id: &str,
        job_id: &str,
        created_at: Timestamp,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO user_jobs (user_id, job_id, created_at) VALUES ($1, $2, $3) \
             ON CONFLICT ON CONSTRAINT pk_user_jobs DO NOTHING",
        )
        .bind(user_id)
        .bind(job_id)
        .bind(created_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// A user's jobs, most recent first.
    pub async fn list_for_user(
        pool: &PgPool,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<UserJobRow>, sqlx::Error> {
        sqlx::query_as::<_, UserJobRow>(
            "SELECT user_id, job_id, created_at FROM user_jobs \
             WHERE user_id = $1 \
             ORDER BY created_at DESC, job_id ASC \
             LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(pool)
        .await
    }

    pub async fn is_member(pool: &PgPool, user_id: &str, job_id: &str) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM user_jobs WHERE user_id = $1 AND job_id = $2)",
        )
        .bind(user_id)
        .bind(job_id)
        .fetch_one(pool)
        .await
    }

    pub async fn remove(pool: &PgPool, user_id: &str, job_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM user_jobs WHERE user_id = $1 AND job_id = $2")
            .bind(user_id)
            .bind(job_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove a job from every user's index.
    pub async fn remove_job(pool: &PgPool, job_id: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM user_jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Drop index entries older than `cutoff`. Returns the number removed.
    pub async fn prune_before(pool: &PgPool, cutoff: Timestamp) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM user_jobs WHERE created_at < $1")
            .bind(cutoff)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
