//! The worker runtime.
//!
//! Claims tasks, runs each in its own tokio task under supervision and
//! reports the outcome. A unit is only removed from the queue by that
//! report; a worker that dies mid-unit stops heart-beating and the reaper
//! of any live worker requeues the unit.
//!
//! Supervision of one execution:
//! - the soft time limit cancels the unit's token;
//! - the hard time limit aborts it;
//! - a revoke request seen on a heartbeat cancels the token, and when it
//!   asks to terminate, aborts at once (SIGKILL) or after a grace period
//!   (SIGTERM);
//! - a lost lease aborts without reporting.

use std::sync::Arc;
use std::time::Duration;

use jokbo_core::live_task::extract_embedded_job_id;
use jokbo_core::task::{RevokeSignal, TimeLimits};
use jokbo_orchestrator::cancellation::CancelProbe;
use jokbo_orchestrator::queue::{ClaimedTask, Lease, QueueError, TaskOutcome, TaskQueue};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backoff::RetryBackoff;
use crate::config::WorkerConfig;
use crate::error::TaskError;
use crate::handlers::{HandlerRegistry, TaskContext, WorkerDeps};

pub const SOFT_LIMIT_EXCEEDED: &str = "Soft time limit exceeded";
pub const HARD_LIMIT_EXCEEDED: &str = "Hard time limit exceeded";

/// Runtime knobs, usually taken from [`WorkerConfig`].
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub worker_name: String,
    pub concurrency: usize,
    pub queues: Vec<String>,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub lease_timeout: Duration,
    pub terminate_grace: Duration,
    pub backoff: RetryBackoff,
}

impl From<&WorkerConfig> for RuntimeSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            worker_name: config.worker_name.clone(),
            concurrency: config.concurrency,
            queues: config.queues.clone(),
            poll_interval: config.poll_interval,
            heartbeat_interval: config.heartbeat_interval,
            lease_timeout: config.lease_timeout,
            terminate_grace: config.terminate_grace,
            backoff: RetryBackoff::with_initial(config.retry_backoff),
        }
    }
}

/// What the runtime did with one claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    Succeeded,
    Failed(String),
    /// Requeued for another attempt after `delay`.
    Retried { delay: Duration },
    Revoked(String),
    /// The lease was lost; the queue owns the task again.
    Abandoned,
}

/// How supervision of one execution ended.
enum Ended {
    Finished(Result<Result<Value, TaskError>, JoinError>),
    HardLimit,
    Killed(RevokeSignal),
    Lost,
}

struct Supervision {
    ended: Ended,
    soft_limit_hit: bool,
    revoke_requested: bool,
}

#[derive(Clone)]
pub struct WorkerRuntime {
    queue: Arc<dyn TaskQueue>,
    handlers: Arc<HandlerRegistry>,
    deps: WorkerDeps,
    settings: Arc<RuntimeSettings>,
}

impl WorkerRuntime {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        handlers: HandlerRegistry,
        deps: WorkerDeps,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            queue,
            handlers: Arc::new(handlers),
            deps,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// Claim and execute until `cancel` is triggered, then wait for the
    /// units still running.
    pub async fn run(self, cancel: CancellationToken) {
        let slots = self.settings.concurrency.max(1);
        tracing::info!(
            worker = %self.settings.worker_name,
            slots,
            queues = ?self.settings.queues,
            "Worker runtime started"
        );

        let permits = Arc::new(Semaphore::new(slots));
        let reaper = tokio::spawn(self.clone().reap_lost(cancel.clone()));

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self
                .queue
                .claim(&self.settings.worker_name, &self.settings.queues)
                .await
            {
                Ok(Some(task)) => {
                    let runtime = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        runtime.execute(task).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if idle(&cancel, self.settings.poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::warn!(error = %e, "Claim failed");
                    if idle(&cancel, self.settings.poll_interval).await {
                        break;
                    }
                }
            }
        }

        tracing::info!(worker = %self.settings.worker_name, "Worker stopping, waiting for running units");
        let all = u32::try_from(slots).unwrap_or(u32::MAX);
        if permits.acquire_many(all).await.is_err() {
            tracing::warn!("Slot semaphore closed during shutdown");
        }
        if let Err(e) = reaper.await {
            tracing::error!(error = %e, "Lost-task reaper panicked");
        }
        tracing::info!(worker = %self.settings.worker_name, "Worker runtime stopped");
    }

    /// Claim one task and execute it inline. `None` if nothing is due.
    pub async fn poll_once(&self) -> Result<Option<Execution>, QueueError> {
        let claimed = self
            .queue
            .claim(&self.settings.worker_name, &self.settings.queues)
            .await?;
        match claimed {
            Some(task) => Ok(Some(self.execute(task).await)),
            None => Ok(None),
        }
    }

    /// Run one claimed task to a reported outcome.
    pub async fn execute(&self, task: ClaimedTask) -> Execution {
        let worker = self.settings.worker_name.as_str();
        let task_id = task.task_id.clone();

        match self.queue.mark_started(&task_id, worker).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(task_id = %task_id, "Reservation lost before start");
                return Execution::Abandoned;
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Could not mark task started");
                return Execution::Abandoned;
            }
        }

        let Some(handler) = self.handlers.get(task.kind) else {
            let reason = format!("No handler registered for {}", task.kind);
            return self.report(&task_id, TaskOutcome::Failed(reason)).await;
        };
        let Some(job_id) = task
            .job_id
            .clone()
            .or_else(|| extract_embedded_job_id(&task.args, &task.kwargs))
        else {
            let reason = "Task carries no job id".to_string();
            return self.report(&task_id, TaskOutcome::Failed(reason)).await;
        };

        tracing::info!(
            task_id = %task_id,
            job_id = %job_id,
            kind = %task.kind,
            attempt = task.attempts + 1,
            worker,
            "Task started"
        );

        let limits = task.limits;
        let attempts = task.attempts;
        let retries_left = task.retries_left();
        let token = CancellationToken::new();
        let ctx = TaskContext {
            probe: CancelProbe::new(job_id.clone(), Arc::clone(&self.deps.store), token.clone()),
            job_id,
            task,
            deps: self.deps.clone(),
        };

        let mut execution = tokio::spawn(async move { handler.run(&ctx).await });
        let supervision = self.supervise(&task_id, limits, &token, &mut execution).await;

        let outcome = match supervision.ended {
            Ended::Finished(Ok(Ok(value))) => TaskOutcome::Succeeded(value),
            Ended::Finished(Ok(Err(TaskError::Cancelled))) => {
                if supervision.revoke_requested {
                    TaskOutcome::Revoked("Revoked".to_string())
                } else if supervision.soft_limit_hit {
                    TaskOutcome::Failed(SOFT_LIMIT_EXCEEDED.to_string())
                } else {
                    TaskOutcome::Revoked("Job cancelled".to_string())
                }
            }
            Ended::Finished(Ok(Err(TaskError::Retry(reason)))) if retries_left => {
                return self.retry(&task_id, attempts, &reason).await;
            }
            Ended::Finished(Ok(Err(TaskError::Retry(reason) | TaskError::Failed(reason)))) => {
                TaskOutcome::Failed(reason)
            }
            Ended::Finished(Err(e)) => TaskOutcome::Failed(format!("Task panicked: {e}")),
            Ended::HardLimit => TaskOutcome::Failed(HARD_LIMIT_EXCEEDED.to_string()),
            Ended::Killed(signal) => TaskOutcome::Revoked(format!("Terminated ({})", signal.as_str())),
            Ended::Lost => return Execution::Abandoned,
        };
        self.report(&task_id, outcome).await
    }

    async fn supervise(
        &self,
        task_id: &str,
        limits: TimeLimits,
        token: &CancellationToken,
        execution: &mut JoinHandle<Result<Value, TaskError>>,
    ) -> Supervision {
        let worker = self.settings.worker_name.as_str();
        let soft = tokio::time::sleep(limits.soft);
        let hard = tokio::time::sleep(limits.hard);
        tokio::pin!(soft);
        tokio::pin!(hard);

        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let mut kill_at: Option<Instant> = None;
        let mut soft_limit_hit = false;
        let mut revoke_requested = false;

        let ended = loop {
            tokio::select! {
                joined = &mut *execution => break Ended::Finished(joined),
                _ = &mut soft, if !soft_limit_hit => {
                    soft_limit_hit = true;
                    tracing::warn!(task_id, soft_ms = limits.soft.as_millis() as u64, "Soft time limit reached");
                    token.cancel();
                }
                _ = &mut hard => {
                    tracing::error!(task_id, hard_ms = limits.hard.as_millis() as u64, "Hard time limit reached, aborting");
                    execution.abort();
                    break Ended::HardLimit;
                }
                _ = tokio::time::sleep_until(kill_at.unwrap_or_else(Instant::now)), if kill_at.is_some() => {
                    tracing::warn!(task_id, "Revoked task ignored SIGTERM, aborting");
                    execution.abort();
                    break Ended::Killed(RevokeSignal::Sigterm);
                }
                _ = heartbeat.tick() => match self.queue.heartbeat(task_id, worker).await {
                    Ok(Lease::Held) => {}
                    Ok(Lease::RevokeRequested(request)) => {
                        if !revoke_requested {
                            tracing::info!(
                                task_id,
                                terminate = request.terminate,
                                signal = request.signal.as_str(),
                                "Revoke requested"
                            );
                        }
                        revoke_requested = true;
                        token.cancel();
                        if request.terminate {
                            match request.signal {
                                RevokeSignal::Sigkill => {
                                    execution.abort();
                                    break Ended::Killed(RevokeSignal::Sigkill);
                                }
                                RevokeSignal::Sigterm => {
                                    kill_at.get_or_insert_with(|| {
                                        Instant::now() + self.settings.terminate_grace
                                    });
                                }
                            }
                        }
                    }
                    Ok(Lease::Lost) => {
                        tracing::warn!(task_id, "Lease lost, abandoning execution");
                        token.cancel();
                        execution.abort();
                        break Ended::Lost;
                    }
                    Err(e) => {
                        tracing::warn!(task_id, error = %e, "Heartbeat failed");
                    }
                },
            }
        };

        Supervision {
            ended,
            soft_limit_hit,
            revoke_requested,
        }
    }

    async fn retry(&self, task_id: &str, attempts: u32, reason: &str) -> Execution {
        let delay = self.settings.backoff.delay_for(attempts);
        match self.queue.retry(task_id, delay, reason).await {
            Ok(true) => {
                tracing::warn!(
                    task_id,
                    attempt = attempts + 1,
                    delay_secs = delay.as_secs(),
                    reason,
                    "Task failed, retrying"
                );
                Execution::Retried { delay }
            }
            Ok(false) => {
                // Not requeued: either a revoke is pending or the lease is gone.
                let worker = self.settings.worker_name.as_str();
                match self.queue.heartbeat(task_id, worker).await {
                    Ok(Lease::RevokeRequested(_)) => {
                        self.report(task_id, TaskOutcome::Revoked("Revoked".to_string()))
                            .await
                    }
                    _ => Execution::Abandoned,
                }
            }
            Err(e) => {
                tracing::error!(task_id, error = %e, "Retry could not be scheduled");
                Execution::Abandoned
            }
        }
    }

    async fn report(&self, task_id: &str, outcome: TaskOutcome) -> Execution {
        let execution = match &outcome {
            TaskOutcome::Succeeded(_) => Execution::Succeeded,
            TaskOutcome::Failed(reason) => Execution::Failed(reason.clone()),
            TaskOutcome::Revoked(reason) => Execution::Revoked(reason.clone()),
        };
        let state = outcome.state();

        match self.queue.finish(task_id, outcome).await {
            Ok(receipt) => {
                if !receipt.transitioned {
                    tracing::debug!(task_id, "Task was already settled");
                }
                if let Some(callback) = receipt.fired_callback {
                    tracing::info!(task_id, aggregation_task_id = %callback, "Batch join released");
                }
                tracing::info!(task_id, state = %state, "Task finished");
            }
            Err(e) => {
                tracing::error!(task_id, error = %e, "Failed to report task outcome");
            }
        }
        execution
    }

    /// Periodically requeue units whose worker stopped heart-beating.
    async fn reap_lost(self, cancel: CancellationToken) {
        let lease = self.settings.lease_timeout;
        let mut interval = tokio::time::interval((lease / 2).max(Duration::from_secs(1)));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => match self.queue.requeue_lost(lease).await {
                    Ok(sweep) if sweep.total() == 0 => {
                        tracing::debug!("Reaper: no lost tasks");
                    }
                    Ok(sweep) => {
                        tracing::info!(
                            requeued = sweep.requeued,
                            failed = sweep.failed,
                            revoked = sweep.revoked,
                            "Reaper: recovered lost tasks"
                        );
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Reaper pass failed");
                    }
                },
            }
        }
    }
}

/// Sleep for `delay` unless cancelled first. `true` if cancelled.
async fn idle(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_worker_config() {
        let config = WorkerConfig::from_lookup(|key| match key {
            "DATABASE_URL" => Some("postgres://localhost/jokbo".to_string()),
            "WORKER_NAME" => Some("w7".to_string()),
            "RETRY_BACKOFF_SECS" => Some("3".to_string()),
            _ => None,
        })
        .unwrap();
        let settings = RuntimeSettings::from(&config);
        assert_eq!(settings.worker_name, "w7");
        assert_eq!(settings.concurrency, 4);
        assert_eq!(settings.backoff.initial_delay, Duration::from_secs(3));
        assert_eq!(settings.backoff.delay_for(1), Duration::from_secs(6));
    }

    #[tokio::test]
    async fn idle_wakes_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(idle(&cancel, Duration::from_secs(60)).await);
        assert!(!idle(&CancellationToken::new(), Duration::from_millis(1)).await);
    }
}
