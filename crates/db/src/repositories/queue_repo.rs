//! Repository for the Postgres-backed task queue (`queue_tasks`,
//! `queue_groups`).
//!
//! Claiming uses `SELECT FOR UPDATE SKIP LOCKED` so any number of workers can
//! poll concurrently. Every move to a terminal state goes through
//! [`QueueRepo::settle`], which is also where a group's join fires: the
//! task transition, the counter bump and the callback release happen in one
//! transaction, and the callback is released only while `fired_at IS NULL`.

use jokbo_core::task::TaskState;
use jokbo_core::types::Timestamp;
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::queue::{
    ClaimedRow, HeartbeatRow, LostSweep, NewQueueTask, QueueGroupRow, QueueTaskRow, SettleOutcome,
};

/// Column list for `queue_tasks` queries.
const COLUMNS: &str = "\
    task_id, kind, job_id, args, kwargs, routing_key, state, worker, attempts, \
    max_retries, eta, soft_limit_secs, hard_limit_secs, group_id, member_index, \
    revoke_requested, revoke_terminate, revoke_signal, heartbeat_at, started_at, \
    finished_at, result, error, created_at";

/// Column list for `queue_groups` queries.
const GROUP_COLUMNS: &str =
    "group_id, job_id, total, terminal_count, callback_task_id, fired_at, created_at";

/// Error recorded on a task whose worker stopped heart-beating.
const WORKER_LOST: &str = "Worker lost";

const INSERT_TASK: &str = "\
    INSERT INTO queue_tasks \
        (task_id, kind, job_id, args, kwargs, routing_key, state, max_retries, \
         soft_limit_secs, hard_limit_secs, group_id, member_index) \
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)";

/// Provides queue operations over `queue_tasks` and `queue_groups`.
pub struct QueueRepo;

impl QueueRepo {
    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Enqueue a standalone task, immediately claimable.
    pub async fn enqueue(pool: &PgPool, task: &NewQueueTask) -> Result<QueueTaskRow, sqlx::Error> {
        let mut tx = pool.begin().await?;
        Self::insert_task(&mut tx, task, TaskState::Scheduled, None, None).await?;
        let row = Self::find_by_id_inner(&mut tx, &task.task_id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        tx.commit().await?;
        Ok(row)
    }

    /// Enqueue a fan-out group with its join continuation.
    ///
    /// Members are claimable immediately. The callback waits until every
    /// member has settled. All rows are written in one transaction.
    pub async fn enqueue_group(
        pool: &PgPool,
        group_id: &str,
        job_id: Option<&str>,
        members: &[NewQueueTask],
        callback: &NewQueueTask,
    ) -> Result<QueueGroupRow, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let query = format!(
            "INSERT INTO queue_groups (group_id, job_id, total, callback_task_id) \
             VALUES ($1, $2, $3, $4) \
             RETURNING {GROUP_COLUMNS}"
        );
        let group = sqlx::query_as::<_, QueueGroupRow>(&query)
            .bind(group_id)
            .bind(job_id)
            .bind(members.len() as i32)
            .bind(&callback.task_id)
            .fetch_one(&mut *tx)
            .await?;

        Self::insert_task(&mut tx, callback, TaskState::Waiting, Some(group_id), None).await?;
        for (index, member) in members.iter().enumerate() {
            Self::insert_task(
                &mut tx,
                member,
                TaskState::Scheduled,
                Some(group_id),
                Some(index as i32),
            )
            .await?;
        }

        tx.commit().await?;
        Ok(group)
    }

    async fn insert_task(
        tx: &mut Transaction<'_, Postgres>,
        task: &NewQueueTask,
        state: TaskState,
        group_id: Option<&str>,
        member_index: Option<i32>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(INSERT_TASK)
            .bind(&task.task_id)
            .bind(&task.kind)
            .bind(&task.job_id)
            .bind(&task.args)
            .bind(&task.kwargs)
            .bind(&task.routing_key)
            .bind(state.as_str())
            .bind(task.max_retries)
            .bind(task.soft_limit_secs)
            .bind(task.hard_limit_secs)
            .bind(group_id)
            .bind(member_index)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Worker side
    // -----------------------------------------------------------------------

    /// Atomically reserve the next due task on any of `routing_keys`.
    ///
    /// A join continuation is returned with its group's members, read in
    /// the same transaction as the reservation.
    pub async fn claim_next(
        pool: &PgPool,
        worker: &str,
        routing_keys: &[String],
    ) -> Result<Option<ClaimedRow>, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let query = format!(
            "UPDATE queue_tasks \
             SET state = 'reserved', worker = $1, heartbeat_at = NOW() \
             WHERE task_id = ( \
                 SELECT task_id FROM queue_tasks \
                 WHERE state = 'scheduled' \
                   AND routing_key = ANY($2) \
                   AND (eta IS NULL OR eta <= NOW()) \
                 ORDER BY COALESCE(eta, created_at) ASC, created_at ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        let task = sqlx::query_as::<_, QueueTaskRow>(&query)
            .bind(worker)
            .bind(routing_keys)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(task) = task else {
            tx.commit().await?;
            return Ok(None);
        };

        let members = match (task.group_id.as_deref(), task.member_index) {
            (Some(group_id), None) => Self::group_members_inner(&mut tx, group_id).await?,
            _ => Vec::new(),
        };
        tx.commit().await?;
        Ok(Some(ClaimedRow { task, members }))
    }

    /// Move a reserved task to active. Returns `false` if the task is no
    /// longer reserved by this worker (revoked or requeued meanwhile).
    pub async fn mark_started(pool: &PgPool, task_id: &str, worker: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE queue_tasks \
             SET state = 'active', started_at = NOW(), heartbeat_at = NOW() \
             WHERE task_id = $1 AND worker = $2 AND state = 'reserved'",
        )
        .bind(task_id)
        .bind(worker)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Refresh the lease and return any pending revoke request.
    ///
    /// `None` means this worker no longer holds the task.
    pub async fn heartbeat(
        pool: &PgPool,
        task_id: &str,
        worker: &str,
    ) -> Result<Option<HeartbeatRow>, sqlx::Error> {
        sqlx::query_as::<_, HeartbeatRow>(
            "UPDATE queue_tasks SET heartbeat_at = NOW() \
             WHERE task_id = $1 AND worker = $2 AND state IN ('reserved', 'active') \
             RETURNING revoke_requested, revoke_terminate, revoke_signal",
        )
        .bind(task_id)
        .bind(worker)
        .fetch_optional(pool)
        .await
    }

    /// Move a task to a terminal state and advance its group's join.
    pub async fn settle(
        pool: &PgPool,
        task_id: &str,
        state: TaskState,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<SettleOutcome, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let outcome = Self::settle_inner(&mut tx, task_id, state, result, error).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn settle_inner(
        tx: &mut Transaction<'_, Postgres>,
        task_id: &str,
        state: TaskState,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<SettleOutcome, sqlx::Error> {
        debug_assert!(state.is_terminal());

        let settled = sqlx::query_as::<_, (Option<String>, Option<i32>)>(
            "UPDATE queue_tasks \
             SET state = $2, result = COALESCE($3, result), error = COALESCE($4, error), \
                 finished_at = NOW(), heartbeat_at = NULL \
             WHERE task_id = $1 AND state NOT IN ('succeeded', 'failed', 'revoked') \
             RETURNING group_id, member_index",
        )
        .bind(task_id)
        .bind(state.as_str())
        .bind(result)
        .bind(error)
        .fetch_optional(&mut **tx)
        .await?;

        let Some((group_id, member_index)) = settled else {
            return Ok(SettleOutcome::default());
        };
        let (Some(group_id), Some(_)) = (group_id, member_index) else {
            return Ok(SettleOutcome {
                transitioned: true,
                fired_callback: None,
            });
        };

        // The row lock taken here serializes concurrent member settlements.
        let (terminal_count, total) = sqlx::query_as::<_, (i32, i32)>(
            "UPDATE queue_groups SET terminal_count = LEAST(terminal_count + 1, total) \
             WHERE group_id = $1 \
             RETURNING terminal_count, total",
        )
        .bind(&group_id)
        .fetch_one(&mut **tx)
        .await?;

        let mut fired_callback = None;
        if terminal_count >= total {
            let callback = sqlx::query_scalar::<_, String>(
                "UPDATE queue_groups SET fired_at = NOW() \
                 WHERE group_id = $1 AND fired_at IS NULL \
                 RETURNING callback_task_id",
            )
            .bind(&group_id)
            .fetch_optional(&mut **tx)
            .await?;

            if let Some(callback) = callback {
                let released = sqlx::query(
                    "UPDATE queue_tasks SET state = 'scheduled' \
                     WHERE task_id = $1 AND state = 'waiting'",
                )
                .bind(&callback)
                .execute(&mut **tx)
                .await?;
                if released.rows_affected() > 0 {
                    fired_callback = Some(callback);
                }
            }
        }

        Ok(SettleOutcome {
            transitioned: true,
            fired_callback,
        })
    }

    /// Put a held task back in the queue after `delay_secs`.
    ///
    /// Returns `false` if the task is not in flight or has a pending revoke.
    pub async fn schedule_retry(
        pool: &PgPool,
        task_id: &str,
        delay_secs: f64,
        reason: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE queue_tasks \
             SET state = 'scheduled', worker = NULL, attempts = attempts + 1, \
                 eta = NOW() + make_interval(secs => $2), error = $3, \
                 heartbeat_at = NULL, started_at = NULL \
             WHERE task_id = $1 AND state IN ('reserved', 'active') AND NOT revoke_requested",
        )
        .bind(task_id)
        .bind(delay_secs)
        .bind(reason)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Recover tasks whose worker stopped heart-beating for `lease_secs`.
    ///
    /// Lost tasks are requeued while retries remain, failed otherwise.
    /// A lost task with a pending revoke is settled as revoked.
    pub async fn requeue_lost(pool: &PgPool, lease_secs: f64) -> Result<LostSweep, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let lost = sqlx::query_as::<_, (String, i32, i32, bool)>(
            "SELECT task_id, attempts, max_retries, revoke_requested FROM queue_tasks \
             WHERE state IN ('reserved', 'active') \
               AND heartbeat_at < NOW() - make_interval(secs => $1) \
             ORDER BY heartbeat_at ASC \
             FOR UPDATE SKIP LOCKED",
        )
        .bind(lease_secs)
        .fetch_all(&mut *tx)
        .await?;

        let mut sweep = LostSweep::default();
        for (task_id, attempts, max_retries, revoke_requested) in lost {
            tracing::warn!(task_id = %task_id, attempts, max_retries, "Lost task recovered");
            if revoke_requested {
                Self::settle_inner(&mut tx, &task_id, TaskState::Revoked, None, Some(WORKER_LOST))
                    .await?;
                sweep.revoked += 1;
            } else if attempts < max_retries {
                sqlx::query(
                    "UPDATE queue_tasks \
                     SET state = 'scheduled', worker = NULL, attempts = attempts + 1, \
                         eta = NULL, error = $2, heartbeat_at = NULL, started_at = NULL \
                     WHERE task_id = $1",
                )
                .bind(&task_id)
                .bind(WORKER_LOST)
                .execute(&mut *tx)
                .await?;
                sweep.requeued += 1;
            } else {
                Self::settle_inner(&mut tx, &task_id, TaskState::Failed, None, Some(WORKER_LOST))
                    .await?;
                sweep.failed += 1;
            }
        }

        tx.commit().await?;
        Ok(sweep)
    }

    // -----------------------------------------------------------------------
    // Revocation
    // -----------------------------------------------------------------------

    /// Revoke a task.
    ///
    /// Queued, waiting and reserved tasks are settled as revoked at once. An
    /// active task gets a revoke request that its worker picks up on the next
    /// heartbeat. Terminal tasks are left alone. Returns the state the task
    /// was in, or `None` if it does not exist.
    pub async fn revoke(
        pool: &PgPool,
        task_id: &str,
        terminate: bool,
        signal: &str,
    ) -> Result<Option<TaskState>, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let prior = Self::revoke_inner(&mut tx, task_id, terminate, signal).await?;
        tx.commit().await?;
        Ok(prior)
    }

    /// Revoke every non-terminal task of a job. Returns how many were hit.
    pub async fn revoke_job(
        pool: &PgPool,
        job_id: &str,
        terminate: bool,
        signal: &str,
    ) -> Result<u64, sqlx::Error> {
        let mut tx = pool.begin().await?;
        // Members first: a callback released by the last member is still
        // in the list and gets revoked after it.
        let task_ids = sqlx::query_scalar::<_, String>(
            "SELECT task_id FROM queue_tasks \
             WHERE job_id = $1 AND state NOT IN ('succeeded', 'failed', 'revoked') \
             ORDER BY (member_index IS NULL) ASC, member_index ASC, created_at ASC",
        )
        .bind(job_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut hit = 0;
        for task_id in task_ids {
            if let Some(prior) = Self::revoke_inner(&mut tx, &task_id, terminate, signal).await? {
                if !prior.is_terminal() {
                    hit += 1;
                }
            }
        }
        tx.commit().await?;
        Ok(hit)
    }

    async fn revoke_inner(
        tx: &mut Transaction<'_, Postgres>,
        task_id: &str,
        terminate: bool,
        signal: &str,
    ) -> Result<Option<TaskState>, sqlx::Error> {
        let state = sqlx::query_scalar::<_, String>(
            "SELECT state FROM queue_tasks WHERE task_id = $1 FOR UPDATE",
        )
        .bind(task_id)
        .fetch_optional(&mut **tx)
        .await?;
        let Some(state) = state else {
            return Ok(None);
        };
        let state: TaskState = state
            .parse()
            .map_err(|e: jokbo_core::error::CoreError| sqlx::Error::Decode(e.to_string().into()))?;

        match state {
            TaskState::Succeeded | TaskState::Failed | TaskState::Revoked => {}
            TaskState::Active => {
                sqlx::query(
                    "UPDATE queue_tasks \
                     SET revoke_requested = true, \
                         revoke_terminate = revoke_terminate OR $2, \
                         revoke_signal = $3 \
                     WHERE task_id = $1",
                )
                .bind(task_id)
                .bind(terminate)
                .bind(signal)
                .execute(&mut **tx)
                .await?;
            }
            TaskState::Waiting | TaskState::Scheduled | TaskState::Reserved => {
                Self::settle_inner(tx, task_id, TaskState::Revoked, None, Some("Revoked")).await?;
            }
        }
        Ok(Some(state))
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn find_by_id(pool: &PgPool, task_id: &str) -> Result<Option<QueueTaskRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM queue_tasks WHERE task_id = $1");
        sqlx::query_as::<_, QueueTaskRow>(&query)
            .bind(task_id)
            .fetch_optional(pool)
            .await
    }

    async fn find_by_id_inner(
        tx: &mut Transaction<'_, Postgres>,
        task_id: &str,
    ) -> Result<Option<QueueTaskRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM queue_tasks WHERE task_id = $1");
        sqlx::query_as::<_, QueueTaskRow>(&query)
            .bind(task_id)
            .fetch_optional(&mut **tx)
            .await
    }

    /// Tasks in flight: scheduled, reserved or active.
    pub async fn list_live(pool: &PgPool) -> Result<Vec<QueueTaskRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM queue_tasks \
             WHERE state IN ('scheduled', 'reserved', 'active') \
             ORDER BY created_at ASC"
        );
        sqlx::query_as::<_, QueueTaskRow>(&query)
            .fetch_all(pool)
            .await
    }

    pub async fn find_group(pool: &PgPool, group_id: &str) -> Result<Option<QueueGroupRow>, sqlx::Error> {
        let query = format!("SELECT {GROUP_COLUMNS} FROM queue_groups WHERE group_id = $1");
        sqlx::query_as::<_, QueueGroupRow>(&query)
            .bind(group_id)
            .fetch_optional(pool)
            .await
    }

    /// Members of a group ordered by their index. The callback is excluded.
    async fn group_members_inner(
        tx: &mut Transaction<'_, Postgres>,
        group_id: &str,
    ) -> Result<Vec<QueueTaskRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM queue_tasks \
             WHERE group_id = $1 AND member_index IS NOT NULL \
             ORDER BY member_index ASC"
        );
        sqlx::query_as::<_, QueueTaskRow>(&query)
            .bind(group_id)
            .fetch_all(&mut **tx)
            .await
    }

    /// Drop finished standalone tasks and fired groups older than `cutoff`.
    ///
    /// Group members and callbacks go with their group.
    pub async fn purge_finished_before(pool: &PgPool, cutoff: Timestamp) -> Result<u64, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let tasks = sqlx::query(
            "DELETE FROM queue_tasks \
             WHERE group_id IS NULL \
               AND state IN ('succeeded', 'failed', 'revoked') \
               AND finished_at < $1",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        let groups = sqlx::query(
            "DELETE FROM queue_groups g \
             WHERE g.fired_at < $1 \
               AND NOT EXISTS ( \
                   SELECT 1 FROM queue_tasks t \
                   WHERE t.group_id = g.group_id \
                     AND t.state NOT IN ('succeeded', 'failed', 'revoked') \
               )",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(tasks.rows_affected() + groups.rows_affected())
    }
}
