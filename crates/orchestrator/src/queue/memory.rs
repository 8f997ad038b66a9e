//! In-process [`TaskQueue`] used by tests and single-process deployments.
//!
//! Mirrors the Postgres backend move for move: every terminal transition
//! goes through one settle path that also advances the group join, and the
//! whole queue sits behind a single lock so each call is atomic.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jokbo_core::live_task::LiveTaskState;
use jokbo_core::task::{RevokeRequest, TaskKind, TaskState, TimeLimits};
use jokbo_core::types::{JobId, TaskId, Timestamp};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::{
    new_task_id, ClaimedTask, FinishReceipt, GroupReceipt, Lease, LostSweep, MemberOutcome,
    QueueError, RawLiveTask, TaskOutcome, TaskQueue, TaskSpec, TaskStatusView,
};

const WORKER_LOST: &str = "Worker lost";

struct Entry {
    task_id: TaskId,
    kind: TaskKind,
    job_id: Option<JobId>,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    routing_key: String,
    max_retries: u32,
    limits: TimeLimits,
    state: TaskState,
    worker: Option<String>,
    attempts: u32,
    eta: Option<Timestamp>,
    group_id: Option<String>,
    member_index: Option<u32>,
    revoke: Option<RevokeRequest>,
    heartbeat_at: Option<Timestamp>,
    result: Option<Value>,
    error: Option<String>,
    finished_at: Option<Timestamp>,
    created_at: Timestamp,
    seq: u64,
}

struct Group {
    total: u32,
    terminal_count: u32,
    callback_id: TaskId,
    fired: bool,
}

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, Entry>,
    groups: HashMap<String, Group>,
    seq: u64,
    unavailable: bool,
}

impl State {
    fn check(&self) -> Result<(), QueueError> {
        if self.unavailable {
            return Err(QueueError::Unavailable("broker unreachable".to_string()));
        }
        Ok(())
    }

    fn insert(
        &mut self,
        spec: TaskSpec,
        state: TaskState,
        group_id: Option<&str>,
        member_index: Option<u32>,
    ) -> TaskId {
        self.seq += 1;
        let task_id = new_task_id();
        self.tasks.insert(
            task_id.clone(),
            Entry {
                task_id: task_id.clone(),
                kind: spec.kind,
                job_id: spec.job_id,
                args: spec.args,
                kwargs: spec.kwargs,
                routing_key: spec.routing_key,
                max_retries: spec.max_retries,
                limits: spec.limits,
                state,
                worker: None,
                attempts: 0,
                eta: None,
                group_id: group_id.map(str::to_string),
                member_index,
                revoke: None,
                heartbeat_at: None,
                result: None,
                error: None,
                finished_at: None,
                created_at: Utc::now(),
                seq: self.seq,
            },
        );
        task_id
    }

    fn settle(
        &mut self,
        task_id: &str,
        state: TaskState,
        result: Option<Value>,
        error: Option<String>,
    ) -> FinishReceipt {
        let Some(entry) = self.tasks.get_mut(task_id) else {
            return FinishReceipt::default();
        };
        if entry.state.is_terminal() {
            return FinishReceipt::default();
        }
        entry.state = state;
        if result.is_some() {
            entry.result = result;
        }
        if error.is_some() {
            entry.error = error;
        }
        entry.finished_at = Some(Utc::now());
        entry.heartbeat_at = None;

        let (Some(group_id), Some(_)) = (entry.group_id.clone(), entry.member_index) else {
            return FinishReceipt {
                transitioned: true,
                fired_callback: None,
            };
        };

        let mut fired_callback = None;
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.terminal_count = (group.terminal_count + 1).min(group.total);
            if group.terminal_count >= group.total && !group.fired {
                group.fired = true;
                let callback_id = group.callback_id.clone();
                if let Some(callback) = self.tasks.get_mut(&callback_id) {
                    if callback.state == TaskState::Waiting {
                        callback.state = TaskState::Scheduled;
                        fired_callback = Some(callback_id);
                    }
                }
            }
        }

        FinishReceipt {
            transitioned: true,
            fired_callback,
        }
    }

    fn revoke(&mut self, task_id: &str, request: RevokeRequest) -> Option<TaskState> {
        let entry = self.tasks.get_mut(task_id)?;
        let prior = entry.state;
        match prior {
            TaskState::Succeeded | TaskState::Failed | TaskState::Revoked => {}
            TaskState::Active => {
                let terminate = request.terminate
                    || entry.revoke.map(|r| r.terminate).unwrap_or(false);
                entry.revoke = Some(RevokeRequest {
                    terminate,
                    signal: request.signal,
                });
            }
            TaskState::Waiting | TaskState::Scheduled | TaskState::Reserved => {
                self.settle(task_id, TaskState::Revoked, None, Some("Revoked".to_string()));
            }
        }
        Some(prior)
    }

    fn group_results(&self, group_id: &str) -> Vec<MemberOutcome> {
        let mut members: Vec<MemberOutcome> = self
            .tasks
            .values()
            .filter(|t| t.group_id.as_deref() == Some(group_id))
            .filter_map(|t| {
                t.member_index.map(|member_index| MemberOutcome {
                    task_id: t.task_id.clone(),
                    member_index,
                    state: t.state,
                    result: t.result.clone(),
                    error: t.error.clone(),
                })
            })
            .collect();
        members.sort_by_key(|m| m.member_index);
        members
    }
}

/// Memory-backed task queue.
#[derive(Default)]
pub struct MemoryTaskQueue {
    state: Mutex<State>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a broker outage: every call fails with `Unavailable` while
    /// set.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Number of tasks in any state.
    pub async fn len(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, spec: TaskSpec) -> Result<TaskId, QueueError> {
        let mut s = self.state.lock().await;
        s.check()?;
        Ok(s.insert(spec, TaskState::Scheduled, None, None))
    }

    async fn enqueue_group(
        &self,
        _job_id: Option<&JobId>,
        members: Vec<TaskSpec>,
        callback: TaskSpec,
    ) -> Result<GroupReceipt, QueueError> {
        if members.is_empty() {
            return Err(QueueError::Invalid("A group needs at least one member".into()));
        }
        let mut s = self.state.lock().await;
        s.check()?;

        let group_id = uuid::Uuid::new_v4().to_string();
        let total = u32::try_from(members.len()).unwrap_or(u32::MAX);
        let callback_id = s.insert(callback, TaskState::Waiting, Some(&group_id), None);
        let member_ids = members
            .into_iter()
            .enumerate()
            .map(|(index, spec)| {
                let index = u32::try_from(index).unwrap_or(u32::MAX);
                s.insert(spec, TaskState::Scheduled, Some(&group_id), Some(index))
            })
            .collect();
        s.groups.insert(
            group_id.clone(),
            Group {
                total,
                terminal_count: 0,
                callback_id: callback_id.clone(),
                fired: false,
            },
        );

        Ok(GroupReceipt {
            group_id,
            member_ids,
            callback_id,
        })
    }

    async fn claim(
        &self,
        worker: &str,
        routing_keys: &[String],
    ) -> Result<Option<ClaimedTask>, QueueError> {
        let mut s = self.state.lock().await;
        s.check()?;
        let now = Utc::now();

        let next = s
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Scheduled)
            .filter(|t| routing_keys.iter().any(|k| *k == t.routing_key))
            .filter(|t| t.eta.map_or(true, |eta| eta <= now))
            .min_by_key(|t| (t.eta.unwrap_or(t.created_at), t.seq))
            .map(|t| t.task_id.clone());
        let Some(task_id) = next else {
            return Ok(None);
        };

        let group_results = match s.tasks.get(&task_id) {
            Some(t) if t.kind == TaskKind::AggregateBatch => t
                .group_id
                .as_deref()
                .map(|g| s.group_results(g))
                .unwrap_or_default(),
            _ => Vec::new(),
        };

        let Some(entry) = s.tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        entry.state = TaskState::Reserved;
        entry.worker = Some(worker.to_string());
        entry.heartbeat_at = Some(now);

        Ok(Some(ClaimedTask {
            task_id: entry.task_id.clone(),
            kind: entry.kind,
            job_id: entry.job_id.clone(),
            args: entry.args.clone(),
            kwargs: entry.kwargs.clone(),
            attempts: entry.attempts,
            max_retries: entry.max_retries,
            limits: entry.limits,
            group_id: entry.group_id.clone(),
            member_index: entry.member_index,
            group_results,
        }))
    }

    async fn mark_started(&self, task_id: &str, worker: &str) -> Result<bool, QueueError> {
        let mut s = self.state.lock().await;
        s.check()?;
        match s.tasks.get_mut(task_id) {
            Some(t) if t.state == TaskState::Reserved && t.worker.as_deref() == Some(worker) => {
                t.state = TaskState::Active;
                t.heartbeat_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn heartbeat(&self, task_id: &str, worker: &str) -> Result<Lease, QueueError> {
        let mut s = self.state.lock().await;
        s.check()?;
        match s.tasks.get_mut(task_id) {
            Some(t)
                if matches!(t.state, TaskState::Reserved | TaskState::Active)
                    && t.worker.as_deref() == Some(worker) =>
            {
                t.heartbeat_at = Some(Utc::now());
                Ok(match t.revoke {
                    Some(request) => Lease::RevokeRequested(request),
                    None => Lease::Held,
                })
            }
            _ => Ok(Lease::Lost),
        }
    }

    async fn finish(&self, task_id: &str, outcome: TaskOutcome) -> Result<FinishReceipt, QueueError> {
        let mut s = self.state.lock().await;
        s.check()?;
        let state = outcome.state();
        let (result, error) = match outcome {
            TaskOutcome::Succeeded(value) => (Some(value), None),
            TaskOutcome::Failed(reason) | TaskOutcome::Revoked(reason) => (None, Some(reason)),
        };
        Ok(s.settle(task_id, state, result, error))
    }

    async fn retry(&self, task_id: &str, delay: Duration, reason: &str) -> Result<bool, QueueError> {
        let mut s = self.state.lock().await;
        s.check()?;
        let Some(t) = s.tasks.get_mut(task_id) else {
            return Ok(false);
        };
        if !matches!(t.state, TaskState::Reserved | TaskState::Active) || t.revoke.is_some() {
            return Ok(false);
        }
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        t.state = TaskState::Scheduled;
        t.worker = None;
        t.attempts += 1;
        t.eta = Utc::now().checked_add_signed(delay);
        t.error = Some(reason.to_string());
        t.heartbeat_at = None;
        Ok(true)
    }

    async fn requeue_lost(&self, lease: Duration) -> Result<LostSweep, QueueError> {
        let mut s = self.state.lock().await;
        s.check()?;
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);

        let mut lost: Vec<(Timestamp, TaskId)> = s
            .tasks
            .values()
            .filter(|t| matches!(t.state, TaskState::Reserved | TaskState::Active))
            .filter_map(|t| t.heartbeat_at.map(|hb| (hb, t.task_id.clone())))
            .filter(|(hb, _)| now.signed_duration_since(*hb) >= lease)
            .collect();
        lost.sort();

        let mut sweep = LostSweep::default();
        for (_, task_id) in lost {
            let Some((attempts, max_retries, revoke_requested)) = s
                .tasks
                .get(&task_id)
                .map(|t| (t.attempts, t.max_retries, t.revoke.is_some()))
            else {
                continue;
            };
            tracing::warn!(task_id = %task_id, attempts, max_retries, "Lost task recovered");
            if revoke_requested {
                s.settle(&task_id, TaskState::Revoked, None, Some(WORKER_LOST.to_string()));
                sweep.revoked += 1;
            } else if attempts < max_retries {
                let Some(t) = s.tasks.get_mut(&task_id) else {
                    continue;
                };
                t.state = TaskState::Scheduled;
                t.worker = None;
                t.attempts += 1;
                t.eta = None;
                t.error = Some(WORKER_LOST.to_string());
                t.heartbeat_at = None;
                sweep.requeued += 1;
            } else {
                s.settle(&task_id, TaskState::Failed, None, Some(WORKER_LOST.to_string()));
                sweep.failed += 1;
            }
        }
        Ok(sweep)
    }

    async fn revoke(&self, task_id: &str, request: RevokeRequest) -> Result<TaskState, QueueError> {
        let mut s = self.state.lock().await;
        s.check()?;
        s.revoke(task_id, request)
            .ok_or_else(|| QueueError::NotFound(task_id.to_string()))
    }

    async fn revoke_job(&self, job_id: &JobId, request: RevokeRequest) -> Result<u64, QueueError> {
        let mut s = self.state.lock().await;
        s.check()?;
        let mut targets: Vec<(bool, Option<u32>, u64, TaskId)> = s
            .tasks
            .values()
            .filter(|t| t.job_id.as_ref() == Some(job_id) && !t.state.is_terminal())
            .map(|t| (t.member_index.is_none(), t.member_index, t.seq, t.task_id.clone()))
            .collect();
        targets.sort();

        let mut hit = 0;
        for (_, _, _, task_id) in targets {
            if let Some(prior) = s.revoke(&task_id, request) {
                if !prior.is_terminal() {
                    hit += 1;
                }
            }
        }
        Ok(hit)
    }

    async fn live_tasks(&self) -> Result<Vec<RawLiveTask>, QueueError> {
        let s = self.state.lock().await;
        s.check()?;
        let mut live: Vec<&Entry> = s.tasks.values().filter(|t| t.state.is_live()).collect();
        live.sort_by_key(|t| t.seq);
        Ok(live
            .into_iter()
            .filter_map(|t| {
                let state = match t.state {
                    TaskState::Active => LiveTaskState::Active,
                    TaskState::Reserved => LiveTaskState::Reserved,
                    TaskState::Scheduled => LiveTaskState::Scheduled,
                    _ => return None,
                };
                Some(RawLiveTask {
                    task_id: t.task_id.clone(),
                    kind: t.kind.name().to_string(),
                    worker: t.worker.clone(),
                    state,
                    routing_key: t.routing_key.clone(),
                    args: t.args.clone(),
                    kwargs: t.kwargs.clone(),
                })
            })
            .collect())
    }

    async fn status(&self, task_id: &str) -> Result<Option<TaskStatusView>, QueueError> {
        let s = self.state.lock().await;
        s.check()?;
        Ok(s.tasks.get(task_id).map(|t| TaskStatusView {
            task_id: t.task_id.clone(),
            kind: t.kind.name().to_string(),
            status: t.state.status(t.attempts),
            state: t.state,
            attempts: t.attempts,
            worker: t.worker.clone(),
            result: t.result.clone(),
            error: t.error.clone(),
            finished_at: t.finished_at,
        }))
    }

    async fn purge_finished_before(&self, cutoff: Timestamp) -> Result<u64, QueueError> {
        let mut s = self.state.lock().await;
        s.check()?;
        let before = s.tasks.len();
        s.tasks.retain(|_, t| {
            t.group_id.is_some()
                || !t.state.is_terminal()
                || t.finished_at.map_or(true, |at| at >= cutoff)
        });
        let mut purged = (before - s.tasks.len()) as u64;

        let done_groups: Vec<String> = s
            .groups
            .iter()
            .filter(|(_, g)| g.fired)
            .map(|(id, _)| id.clone())
            .filter(|id| {
                s.tasks
                    .values()
                    .filter(|t| t.group_id.as_deref() == Some(id.as_str()))
                    .all(|t| t.state.is_terminal() && t.finished_at.map_or(false, |at| at < cutoff))
            })
            .collect();
        for group_id in done_groups {
            s.groups.remove(&group_id);
            s.tasks
                .retain(|_, t| t.group_id.as_deref() != Some(group_id.as_str()));
            purged += 1;
        }
        Ok(purged)
    }
}
