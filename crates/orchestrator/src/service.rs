//! The caller-facing orchestrator.
//!
//! Every operation that touches a specific job takes a [`Requester`] and
//! checks ownership against the job record before doing anything else.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jokbo_core::error::CoreError;
use jokbo_core::job::{Job, NewJob};
use jokbo_core::mode::AnalysisMode;
use jokbo_core::progress::{ProgressSnapshot, StalledJob};
use jokbo_core::task::{RevokeSignal, TaskKind, TaskStatus};
use jokbo_core::types::{JobId, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::access::Requester;
use crate::cancellation::{CancelOutcome, CancellationCoordinator};
use crate::config::OrchestratorConfig;
use crate::dispatcher::{BatchHandle, TaskArgs, TaskDispatcher};
use crate::file_refs::FileRefStore;
use crate::progress::ProgressTracker;
use crate::queue::{TaskQueue, TaskStatusView};
use crate::quota::{Debit, QuotaLedger};
use crate::reconciler::{GhostReport, GhostTask, Reconciler};
use crate::registry::JobRegistry;
use crate::store::JobStore;

/// Initial progress message of a single-task job.
pub const MSG_QUEUED: &str = "Queued";

// ---------------------------------------------------------------------------
// Operation results
// ---------------------------------------------------------------------------

/// A job that has been handed to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedJob {
    pub job_id: JobId,
    /// The task bound to the job: the single task, or the batch aggregation.
    pub task_id: TaskId,
    pub batch: Option<BatchHandle>,
    /// Tokens charged for the run, zero for untracked users.
    pub charged: i64,
}

/// Status label of an entry in a user's job list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobListStatus {
    Pending,
    Started,
    Retry,
    Success,
    Failure,
    Revoked,
    Cancelled,
    Draft,
    Unknown,
}

impl From<TaskStatus> for JobListStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Pending => JobListStatus::Pending,
            TaskStatus::Started => JobListStatus::Started,
            TaskStatus::Retry => JobListStatus::Retry,
            TaskStatus::Success => JobListStatus::Success,
            TaskStatus::Failure => JobListStatus::Failure,
            TaskStatus::Revoked => JobListStatus::Revoked,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserJobEntry {
    pub job_id: JobId,
    pub status: JobListStatus,
    pub mode: Option<AnalysisMode>,
    pub created_at: Option<DateTime<Utc>>,
    pub progress: Option<ProgressSnapshot>,
    pub has_result: bool,
    pub draft: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOutcome {
    /// A running task was revoked before deletion.
    pub revoked: bool,
}

/// What an administrative revoke targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevokeTarget {
    Task(TaskId),
    /// Every unfinished task of the job.
    Job(JobId),
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    registry: JobRegistry,
    dispatcher: TaskDispatcher,
    progress: ProgressTracker,
    cancellation: CancellationCoordinator,
    reconciler: Reconciler,
    quota: QuotaLedger,
    file_refs: Arc<dyn FileRefStore>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        file_refs: Arc<dyn FileRefStore>,
        config: OrchestratorConfig,
    ) -> Self {
        let registry = JobRegistry::new(Arc::clone(&store));
        let dispatcher = TaskDispatcher::new(queue, config.max_task_retries);
        let progress = ProgressTracker::new(Arc::clone(&store));
        let cancellation = CancellationCoordinator::new(
            Arc::clone(&store),
            registry.clone(),
            progress.clone(),
            dispatcher.clone(),
        );
        let reconciler = Reconciler::new(dispatcher.clone(), progress.clone(), cancellation.clone());
        let quota = QuotaLedger::new(Arc::clone(&store), config.quota_policy, config.token_rates);
        Self {
            store,
            registry,
            dispatcher,
            progress,
            cancellation,
            reconciler,
            quota,
            file_refs,
            config,
        }
    }

    /// Wire the orchestrator to Postgres for both the store and the queue.
    pub fn with_postgres(
        pool: jokbo_db::DbPool,
        file_refs: Arc<dyn FileRefStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self::new(
            Arc::new(crate::store::PgJobStore::new(pool.clone())),
            Arc::new(crate::queue::PgTaskQueue::new(pool)),
            file_refs,
            config,
        )
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn cancellation(&self) -> &CancellationCoordinator {
        &self.cancellation
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn quota(&self) -> &QuotaLedger {
        &self.quota
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Validate and persist a new draft job.
    ///
    /// A user requester always becomes the owner. Refused with
    /// `QuotaExhausted` when the owner's tracked balance is used up.
    pub async fn create_job(&self, requester: &Requester, input: NewJob) -> Result<Job, CoreError> {
        let mut input = input;
        if let Requester::User(user_id) = requester {
            input.owner_user_id = Some(user_id.clone());
        }
        let job = Job::from_new(input, Utc::now())?;

        self.refresh_inputs(&job).await;

        if let Some(owner) = job.owner_user_id.as_deref() {
            self.quota.check_admission(owner).await?;
        }

        self.registry.create(&job).await?;
        if let Some(owner) = job.owner_user_id.as_deref() {
            self.registry.add_user_job(owner, &job.job_id).await?;
        }
        Ok(job)
    }

    /// Dispatch a draft job.
    ///
    /// Charges the owner, initializes progress, enqueues the work and binds
    /// the resulting task. Any failure after the charge refunds it and
    /// removes the progress record again, leaving the job a draft.
    pub async fn start_job(
        &self,
        requester: &Requester,
        job_id: &JobId,
    ) -> Result<StartedJob, CoreError> {
        let job = self.registry.get_metadata(job_id).await?;
        requester.authorize(&job)?;
        if !job.is_draft() {
            return Err(CoreError::Conflict(format!("Job {job_id} has already been started")));
        }

        self.refresh_inputs(&job).await;

        let units = job.unit_count();
        let debit = match job.owner_user_id.as_deref() {
            Some(owner) => self.quota.debit(owner, job.model_tier, units).await?,
            None => None,
        };

        let message = if job.is_batch {
            format!("Batch started: {units} units")
        } else {
            MSG_QUEUED.to_string()
        };
        if let Err(e) = self.progress.init(job_id, units, &message).await {
            self.refund(debit.as_ref()).await;
            return Err(e);
        }

        let dispatched = if job.is_batch {
            self.dispatch_batch(&job).await
        } else {
            self.dispatch_single(&job).await
        };
        let (task_id, batch) = match dispatched {
            Ok(ok) => ok,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Dispatch failed, rolling back start");
                self.undo_start(job_id, debit.as_ref()).await;
                return Err(e);
            }
        };

        let bound = self
            .registry
            .update_metadata(job_id, |j| {
                j.bound_task_id = Some(task_id.clone());
                j.is_preflight = false;
            })
            .await;
        if let Err(e) = bound {
            tracing::error!(job_id = %job_id, error = %e, "Binding task failed, revoking dispatched work");
            self.dispatcher
                .revoke_job(job_id, true, RevokeSignal::Sigterm)
                .await;
            self.undo_start(job_id, debit.as_ref()).await;
            return Err(e);
        }

        tracing::info!(job_id = %job_id, task_id = %task_id, units, batch = job.is_batch, "Job started");
        Ok(StartedJob {
            job_id: job_id.clone(),
            task_id,
            batch,
            charged: debit.map(|d| d.amount).unwrap_or(0),
        })
    }

    /// Create and start in one call. A failed start deletes the new job.
    pub async fn submit_job(
        &self,
        requester: &Requester,
        input: NewJob,
    ) -> Result<StartedJob, CoreError> {
        let job = self.create_job(requester, input).await?;
        match self.start_job(requester, &job.job_id).await {
            Ok(started) => Ok(started),
            Err(e) => {
                if let Err(cleanup) = self.registry.delete_all(&job.job_id).await {
                    tracing::warn!(job_id = %job.job_id, error = %cleanup, "Rollback of failed submit incomplete");
                }
                Err(e)
            }
        }
    }

    async fn dispatch_single(&self, job: &Job) -> Result<(TaskId, Option<BatchHandle>), CoreError> {
        let kind = TaskKind::for_single(job.mode)?;
        let args = TaskArgs::new(vec![json!(job.job_id.as_str())], unit_kwargs(job));
        let task_id = self.dispatcher.submit_single(&job.job_id, kind, args).await?;
        Ok((task_id, None))
    }

    async fn dispatch_batch(&self, job: &Job) -> Result<(TaskId, Option<BatchHandle>), CoreError> {
        let unit_mode = job.batch_unit_mode.unwrap_or(AnalysisMode::JokboCentric);
        let counterparts = json!(job.input_refs.counterpart);
        let arg_sets = job
            .input_refs
            .primary
            .iter()
            .enumerate()
            .map(|(index, key)| {
                TaskArgs::new(
                    vec![
                        json!(job.job_id.as_str()),
                        json!(unit_mode.as_str()),
                        json!(index),
                        json!(key),
                        counterparts.clone(),
                    ],
                    unit_kwargs(job),
                )
            })
            .collect();
        let handle = self
            .dispatcher
            .submit_batch(&job.job_id, TaskKind::BatchAnalyzeSingle, arg_sets)
            .await?;
        Ok((handle.aggregation_task_id.clone(), Some(handle)))
    }

    async fn undo_start(&self, job_id: &JobId, debit: Option<&Debit>) {
        self.refund(debit).await;
        if let Err(e) = self.progress.delete(job_id).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to remove progress of unstarted job");
        }
    }

    async fn refund(&self, debit: Option<&Debit>) {
        if let Some(debit) = debit {
            self.quota.refund(debit).await;
        }
    }

    async fn refresh_inputs(&self, job: &Job) {
        let keys = job.input_refs.all_keys();
        if keys.is_empty() {
            return;
        }
        if let Err(e) = self.file_refs.refresh_ttls(&keys).await {
            tracing::warn!(job_id = %job.job_id, error = %e, "Input TTL refresh failed");
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get_status(&self, task_id: &str) -> Result<TaskStatusView, CoreError> {
        self.dispatcher.status(task_id).await
    }

    pub async fn get_progress(
        &self,
        requester: &Requester,
        job_id: &JobId,
    ) -> Result<ProgressSnapshot, CoreError> {
        let job = self.registry.get_metadata(job_id).await?;
        requester.authorize(&job)?;
        self.progress.read(job_id).await
    }

    /// The final artifact. `NotFound` until the job has completed.
    pub async fn get_result(&self, requester: &Requester, job_id: &JobId) -> Result<Value, CoreError> {
        let job = self.registry.get_metadata(job_id).await?;
        requester.authorize(&job)?;
        self.store
            .get_final(job_id)
            .await?
            .ok_or_else(|| CoreError::not_found("Result", job_id))
    }

    /// A user's jobs, most recent first.
    ///
    /// Drafts are left out unless `include_preflight`. Entries whose details
    /// cannot be read are reported with status `UNKNOWN`.
    pub async fn list_user_jobs(
        &self,
        requester: &Requester,
        user_id: &str,
        limit: Option<usize>,
        include_preflight: bool,
    ) -> Result<Vec<UserJobEntry>, CoreError> {
        requester.authorize_user(user_id)?;
        let limit = limit.unwrap_or(self.config.user_jobs_limit);
        let job_ids = self.registry.get_user_jobs(user_id, limit).await?;

        let mut entries = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            let job = self.registry.find(&job_id).await.unwrap_or_else(|e| {
                tracing::warn!(job_id = %job_id, error = %e, "Job lookup failed while listing");
                None
            });
            let draft = job.as_ref().map_or(false, |j| j.is_preflight);
            if draft && !include_preflight {
                continue;
            }

            let progress = self.progress.read(&job_id).await.ok();
            let has_result = matches!(self.store.get_final(&job_id).await, Ok(Some(_)));

            let bound_task = job.as_ref().and_then(|j| j.bound_task_id.as_deref());
            let mut status = match bound_task {
                Some(task_id) => self
                    .dispatcher
                    .status(task_id)
                    .await
                    .map(|view| JobListStatus::from(view.status))
                    .unwrap_or(JobListStatus::Unknown),
                None if draft => JobListStatus::Draft,
                None if has_result => JobListStatus::Success,
                None => JobListStatus::Unknown,
            };
            if matches!(self.store.is_cancelled(&job_id).await, Ok(true)) {
                status = JobListStatus::Cancelled;
            }

            entries.push(UserJobEntry {
                mode: job.as_ref().map(|j| j.mode),
                created_at: job.as_ref().map(|j| j.created_at),
                job_id,
                status,
                progress,
                has_result,
                draft,
            });
        }
        Ok(entries)
    }

    // -----------------------------------------------------------------------
    // Cancellation and deletion
    // -----------------------------------------------------------------------

    pub async fn cancel_job(
        &self,
        requester: &Requester,
        job_id: &JobId,
    ) -> Result<CancelOutcome, CoreError> {
        self.cancellation.cancel_job(job_id, requester).await
    }

    /// Delete a job and everything recorded for it.
    ///
    /// Owners may delete; so may any user whose job list still contains
    /// the job. With `cancel_if_running`, a running task is revoked first.
    pub async fn delete_job(
        &self,
        requester: &Requester,
        job_id: &JobId,
        cancel_if_running: bool,
    ) -> Result<DeleteOutcome, CoreError> {
        let job = self.registry.find(job_id).await?;
        self.authorize_delete(requester, job_id, job.as_ref()).await?;

        let mut revoked = false;
        if cancel_if_running {
            if let Some(job) = &job {
                revoked = self.revoke_if_running(job).await;
            }
        }

        self.registry.delete_all(job_id).await?;
        Ok(DeleteOutcome { revoked })
    }

    async fn authorize_delete(
        &self,
        requester: &Requester,
        job_id: &JobId,
        job: Option<&Job>,
    ) -> Result<(), CoreError> {
        let denied = match job {
            Some(job) => match requester.authorize(job) {
                Ok(()) => return Ok(()),
                Err(e) => e,
            },
            None => CoreError::not_found("Job", job_id),
        };
        if let Requester::User(user_id) = requester {
            if self.registry.is_user_job(user_id, job_id).await? {
                return Ok(());
            }
        }
        Err(denied)
    }

    async fn revoke_if_running(&self, job: &Job) -> bool {
        let Some(task_id) = job.bound_task_id.as_deref() else {
            return false;
        };
        match self.dispatcher.status(task_id).await {
            Ok(view) if view.status.is_running() => {
                let mut revoked = self
                    .dispatcher
                    .revoke(task_id, true, RevokeSignal::Sigterm)
                    .await;
                if job.is_batch {
                    revoked |= self
                        .dispatcher
                        .revoke_job(&job.job_id, true, RevokeSignal::Sigterm)
                        .await;
                }
                revoked
            }
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(job_id = %job.job_id, error = %e, "Task status unavailable, not revoking");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Administration
    // -----------------------------------------------------------------------

    pub async fn list_ghosts(&self) -> Result<Vec<GhostTask>, CoreError> {
        self.reconciler.list_ghosts().await
    }

    pub async fn remediate_ghosts(&self, dry_run: bool) -> Result<GhostReport, CoreError> {
        self.reconciler.remediate_ghosts(dry_run).await
    }

    /// Stalled jobs, using the configured threshold unless one is given.
    pub async fn list_stalled(
        &self,
        threshold_minutes: Option<u32>,
    ) -> Result<Vec<StalledJob>, CoreError> {
        let threshold = match threshold_minutes {
            Some(minutes) => chrono::Duration::minutes(i64::from(minutes)),
            None => chrono::Duration::from_std(self.config.stall_threshold)
                .map_err(|e| CoreError::Internal(e.to_string()))?,
        };
        self.reconciler.list_stalled(threshold).await
    }

    pub async fn revoke(&self, target: RevokeTarget, forceful: bool, signal: RevokeSignal) -> bool {
        match target {
            RevokeTarget::Task(task_id) => self.dispatcher.revoke(&task_id, forceful, signal).await,
            RevokeTarget::Job(job_id) => self.dispatcher.revoke_job(&job_id, forceful, signal).await,
        }
    }
}

/// Keyword arguments shared by every analysis unit of a job.
fn unit_kwargs(job: &Job) -> Map<String, Value> {
    let mut kwargs = Map::new();
    kwargs.insert("model_type".into(), json!(job.model_tier.as_str()));
    kwargs.insert("multi_api".into(), json!(job.multi_api));
    kwargs.insert("min_relevance".into(), json!(job.min_relevance));
    kwargs
}
