//! Repository for the `user_quotas` table.

use sqlx::PgPool;

/// Provides per-user token balances.
pub struct QuotaRepo;

impl QuotaRepo {
    /// Current balance, or `None` if the user has never been credited.
    pub async fn get(pool: &PgPool, user_id: &str) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT balance FROM user_quotas WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(pool)
            .await
    }

    /// Overwrite a balance.
    pub async fn set(pool: &PgPool, user_id: &str, balance: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO user_quotas (user_id, balance) VALUES ($1, $2) \
             ON CONFLICT (user_id) DO UPDATE SET balance = EXCLUDED.balance, updated_at = NOW()",
        )
        .bind(user_id)
        .bind(balance)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Atomically add `delta` (may be negative) and return the new balance.
    ///
    /// A missing row counts as a zero balance.
    pub async fn add(pool: &PgPool, user_id: &str, delta: i64) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO user_quotas (user_id, balance) VALUES ($1, $2) \
             ON CONFLICT (user_id) DO UPDATE \
                 SET balance = user_quotas.balance + EXCLUDED.balance, updated_at = NOW() \
             RETURNING balance",
        )
        .bind(user_id)
        .bind(delta)
        .fetch_one(pool)
        .await
    }
}
