//! [`TaskQueue`] over `jokbo_db::repositories::QueueRepo`.

use std::time::Duration;

use async_trait::async_trait;
use jokbo_core::live_task::LiveTaskState;
use jokbo_core::task::{RevokeRequest, RevokeSignal, TaskKind, TaskState, TimeLimits};
use jokbo_core::types::{JobId, TaskId, Timestamp};
use jokbo_db::models::queue::{ClaimedRow, NewQueueTask, QueueTaskRow};
use jokbo_db::repositories::QueueRepo;
use jokbo_db::DbPool;
use serde_json::{Map, Value};

use super::{
    new_task_id, ClaimedTask, FinishReceipt, GroupReceipt, Lease, LostSweep, MemberOutcome,
    QueueError, RawLiveTask, TaskOutcome, TaskQueue, TaskSpec, TaskStatusView,
};

fn unavailable(err: sqlx::Error) -> QueueError {
    tracing::error!(error = %err, "Queue database error");
    QueueError::Unavailable(err.to_string())
}

fn secs(d: Duration) -> i32 {
    i32::try_from(d.as_secs()).unwrap_or(i32::MAX)
}

fn new_row(task_id: TaskId, spec: &TaskSpec) -> NewQueueTask {
    NewQueueTask {
        task_id,
        kind: spec.kind.name().to_string(),
        job_id: spec.job_id.as_ref().map(|id| id.as_str().to_string()),
        args: Value::Array(spec.args.clone()),
        kwargs: Value::Object(spec.kwargs.clone()),
        routing_key: spec.routing_key.clone(),
        max_retries: i32::try_from(spec.max_retries).unwrap_or(i32::MAX),
        soft_limit_secs: secs(spec.limits.soft),
        hard_limit_secs: secs(spec.limits.hard),
    }
}

fn parse_state(row: &QueueTaskRow) -> Result<TaskState, QueueError> {
    row.state
        .parse()
        .map_err(|e: jokbo_core::error::CoreError| QueueError::Invalid(e.to_string()))
}

fn args_of(row: &QueueTaskRow) -> Vec<Value> {
    row.args.as_array().cloned().unwrap_or_default()
}

fn kwargs_of(row: &QueueTaskRow) -> Map<String, Value> {
    row.kwargs.as_object().cloned().unwrap_or_default()
}

fn count(n: i32) -> u32 {
    u32::try_from(n).unwrap_or(0)
}

/// Postgres-backed task queue.
#[derive(Clone)]
pub struct PgTaskQueue {
    pool: DbPool,
}

impl PgTaskQueue {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Convert a reserved row. Fails only on rows this build cannot decode.
fn to_claimed(claimed: ClaimedRow) -> Result<ClaimedTask, QueueError> {
    let ClaimedRow { task: row, members } = claimed;
    let kind: TaskKind = row
        .kind
        .parse()
        .map_err(|e: jokbo_core::error::CoreError| QueueError::Invalid(e.to_string()))?;

    let mut group_results = Vec::with_capacity(members.len());
    if kind == TaskKind::AggregateBatch {
        for member in members {
            group_results.push(MemberOutcome {
                state: parse_state(&member)?,
                member_index: member.member_index.map(count).unwrap_or_default(),
                task_id: member.task_id,
                result: member.result,
                error: member.error,
            });
        }
    }

    Ok(ClaimedTask {
        args: args_of(&row),
        kwargs: kwargs_of(&row),
        kind,
        job_id: row.job_id.map(JobId::from),
        attempts: count(row.attempts),
        max_retries: count(row.max_retries),
        limits: TimeLimits {
            soft: Duration::from_secs(u64::from(count(row.soft_limit_secs))),
            hard: Duration::from_secs(u64::from(count(row.hard_limit_secs))),
        },
        group_id: row.group_id,
        member_index: row.member_index.map(count),
        task_id: row.task_id,
        group_results,
    })
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, spec: TaskSpec) -> Result<TaskId, QueueError> {
        let row = QueueRepo::enqueue(&self.pool, &new_row(new_task_id(), &spec))
            .await
            .map_err(unavailable)?;
        Ok(row.task_id)
    }

    async fn enqueue_group(
        &self,
        job_id: Option<&JobId>,
        members: Vec<TaskSpec>,
        callback: TaskSpec,
    ) -> Result<GroupReceipt, QueueError> {
        if members.is_empty() {
            return Err(QueueError::Invalid("A group needs at least one member".into()));
        }
        let group_id = uuid::Uuid::new_v4().to_string();
        let member_rows: Vec<NewQueueTask> = members
            .iter()
            .map(|spec| new_row(new_task_id(), spec))
            .collect();
        let callback_row = new_row(new_task_id(), &callback);

        QueueRepo::enqueue_group(
            &self.pool,
            &group_id,
            job_id.map(|id| id.as_str()),
            &member_rows,
            &callback_row,
        )
        .await
        .map_err(unavailable)?;

        Ok(GroupReceipt {
            group_id,
            member_ids: member_rows.into_iter().map(|r| r.task_id).collect(),
            callback_id: callback_row.task_id,
        })
    }

    async fn claim(
        &self,
        worker: &str,
        routing_keys: &[String],
    ) -> Result<Option<ClaimedTask>, QueueError> {
        loop {
            let Some(claimed) = QueueRepo::claim_next(&self.pool, worker, routing_keys)
                .await
                .map_err(unavailable)?
            else {
                return Ok(None);
            };
            let task_id = claimed.task.task_id.clone();
            match to_claimed(claimed) {
                Ok(task) => return Ok(Some(task)),
                Err(e) => {
                    // Undecodable rows never succeed on a retry.
                    tracing::warn!(task_id = %task_id, error = %e, "Failing undecodable task");
                    let reason = e.to_string();
                    QueueRepo::settle(&self.pool, &task_id, TaskState::Failed, None, Some(&reason))
                        .await
                        .map_err(unavailable)?;
                }
            }
        }
    }

    async fn mark_started(&self, task_id: &str, worker: &str) -> Result<bool, QueueError> {
        QueueRepo::mark_started(&self.pool, task_id, worker)
            .await
            .map_err(unavailable)
    }

    async fn heartbeat(&self, task_id: &str, worker: &str) -> Result<Lease, QueueError> {
        let row = QueueRepo::heartbeat(&self.pool, task_id, worker)
            .await
            .map_err(unavailable)?;
        Ok(match row {
            None => Lease::Lost,
            Some(hb) if hb.revoke_requested => {
                let signal = hb
                    .revoke_signal
                    .as_deref()
                    .and_then(|s| s.parse::<RevokeSignal>().ok())
                    .unwrap_or_default();
                Lease::RevokeRequested(RevokeRequest {
                    terminate: hb.revoke_terminate,
                    signal,
                })
            }
            Some(_) => Lease::Held,
        })
    }

    async fn finish(&self, task_id: &str, outcome: TaskOutcome) -> Result<FinishReceipt, QueueError> {
        let state = outcome.state();
        let (result, error) = match &outcome {
            TaskOutcome::Succeeded(value) => (Some(value), None),
            TaskOutcome::Failed(reason) | TaskOutcome::Revoked(reason) => (None, Some(reason.as_str())),
        };
        let settled = QueueRepo::settle(&self.pool, task_id, state, result, error)
            .await
            .map_err(unavailable)?;
        Ok(FinishReceipt {
            transitioned: settled.transitioned,
            fired_callback: settled.fired_callback,
        })
    }

    async fn retry(&self, task_id: &str, delay: Duration, reason: &str) -> Result<bool, QueueError> {
        QueueRepo::schedule_retry(&self.pool, task_id, delay.as_secs_f64(), reason)
            .await
            .map_err(unavailable)
    }

    async fn requeue_lost(&self, lease: Duration) -> Result<LostSweep, QueueError> {
        let sweep = QueueRepo::requeue_lost(&self.pool, lease.as_secs_f64())
            .await
            .map_err(unavailable)?;
        Ok(LostSweep {
            requeued: sweep.requeued,
            failed: sweep.failed,
            revoked: sweep.revoked,
        })
    }

    async fn revoke(&self, task_id: &str, request: RevokeRequest) -> Result<TaskState, QueueError> {
        QueueRepo::revoke(&self.pool, task_id, request.terminate, request.signal.as_str())
            .await
            .map_err(unavailable)?
            .ok_or_else(|| QueueError::NotFound(task_id.to_string()))
    }

    async fn revoke_job(&self, job_id: &JobId, request: RevokeRequest) -> Result<u64, QueueError> {
        QueueRepo::revoke_job(
            &self.pool,
            job_id.as_str(),
            request.terminate,
            request.signal.as_str(),
        )
        .await
        .map_err(unavailable)
    }

    async fn live_tasks(&self) -> Result<Vec<RawLiveTask>, QueueError> {
        let rows = QueueRepo::list_live(&self.pool)
            .await
            .map_err(unavailable)?;
        let mut live = Vec::with_capacity(rows.len());
        for row in rows {
            let state = match parse_state(&row)? {
                TaskState::Active => LiveTaskState::Active,
                TaskState::Reserved => LiveTaskState::Reserved,
                TaskState::Scheduled => LiveTaskState::Scheduled,
                _ => continue,
            };
            live.push(RawLiveTask {
                args: args_of(&row),
                kwargs: kwargs_of(&row),
                task_id: row.task_id,
                kind: row.kind,
                worker: row.worker,
                state,
                routing_key: row.routing_key,
            });
        }
        Ok(live)
    }

    async fn status(&self, task_id: &str) -> Result<Option<TaskStatusView>, QueueError> {
        let row = QueueRepo::find_by_id(&self.pool, task_id)
            .await
            .map_err(unavailable)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let state = parse_state(&row)?;
        let attempts = count(row.attempts);
        Ok(Some(TaskStatusView {
            task_id: row.task_id,
            kind: row.kind,
            status: state.status(attempts),
            state,
            attempts,
            worker: row.worker,
            result: row.result,
            error: row.error,
            finished_at: row.finished_at,
        }))
    }

    async fn purge_finished_before(&self, cutoff: Timestamp) -> Result<u64, QueueError> {
        QueueRepo::purge_finished_before(&self.pool, cutoff)
            .await
            .map_err(unavailable)
    }
}
