//! Ghost and stall detection, concurrent progress and the periodic loops.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use common::{batch_input, claim, harness, single_input};
use jokbo_core::live_task::LiveTaskState;
use jokbo_core::mode::AnalysisMode;
use jokbo_core::progress::{ProgressRecord, ProgressUpdate};
use jokbo_core::task::{RevokeRequest, RevokeSignal, TaskKind, TaskState};
use jokbo_core::types::JobId;
use jokbo_orchestrator::access::Requester;
use jokbo_orchestrator::background::{RetentionSweep, Watchdog};
use jokbo_orchestrator::dispatcher::TaskArgs;
use jokbo_orchestrator::queue::{Lease, TaskOutcome, TaskQueue};
use jokbo_orchestrator::store::JobStore;
use serde_json::{json, Map};

async fn orphan_task(h: &common::Harness) -> (JobId, String) {
    let job_id = JobId::generate();
    let task_id = h
        .orchestrator
        .dispatcher()
        .submit_single(
            &job_id,
            TaskKind::RunJokboAnalysis,
            TaskArgs::new(vec![json!(job_id.as_str())], Map::new()),
        )
        .await
        .unwrap();
    (job_id, task_id)
}

fn record_idle_for(job_id: &JobId, total: u32, completed: u32, minutes: i64) -> ProgressRecord {
    let at = Utc::now() - chrono::Duration::minutes(minutes);
    ProgressRecord {
        job_id: job_id.clone(),
        total_units: total,
        completed_units: completed,
        message: "working".to_string(),
        started_at: at,
        last_update_at: Some(at),
    }
}

// ---------------------------------------------------------------------------
// Ghosts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ghost_remediation_reports_then_revokes() {
    let h = harness();
    let (ghost_job, ghost_task) = orphan_task(&h).await;
    let tracked = h
        .orchestrator
        .submit_job(&Requester::user("alice"), single_input(AnalysisMode::ExamOnly))
        .await
        .unwrap();

    let report = h.orchestrator.remediate_ghosts(true).await.unwrap();
    assert!(report.dry_run);
    assert_eq!(report.found, 1);
    assert_eq!(report.revoked, 0);
    assert_eq!(report.ghosts[0].task_id, ghost_task);
    assert_eq!(report.ghosts[0].job_id, ghost_job);
    assert_eq!(report.ghosts[0].state, LiveTaskState::Scheduled);
    assert!(!h.store.is_cancelled(&ghost_job).await.unwrap());

    let report = h.orchestrator.remediate_ghosts(false).await.unwrap();
    assert_eq!(report.found, 1);
    assert_eq!(report.revoked, 1);
    assert!(h.store.is_cancelled(&ghost_job).await.unwrap());
    let view = h.orchestrator.get_status(&ghost_task).await.unwrap();
    assert_eq!(view.state, TaskState::Revoked);

    let tracked_view = h.orchestrator.get_status(&tracked.task_id).await.unwrap();
    assert_eq!(tracked_view.state, TaskState::Scheduled);
    assert!(h.orchestrator.list_ghosts().await.unwrap().is_empty());
}

#[tokio::test]
async fn active_ghost_gets_a_forceful_revoke_request() {
    let h = harness();
    let (ghost_job, ghost_task) = orphan_task(&h).await;
    let claimed = claim(&h.queue, "w1").await;
    assert_eq!(claimed.task_id, ghost_task);
    assert!(h.queue.mark_started(&ghost_task, "w1").await.unwrap());

    let report = h.orchestrator.remediate_ghosts(true).await.unwrap();
    assert_eq!(report.found, 1);
    assert_eq!(report.ghosts[0].state, LiveTaskState::Active);
    assert_eq!(report.ghosts[0].worker.as_deref(), Some("w1"));
    assert!(!h.store.is_cancelled(&ghost_job).await.unwrap());
    assert_eq!(h.queue.heartbeat(&ghost_task, "w1").await.unwrap(), Lease::Held);

    let report = h.orchestrator.remediate_ghosts(false).await.unwrap();
    assert_eq!(report.revoked, 1);
    assert!(h.store.is_cancelled(&ghost_job).await.unwrap());
    // Still running until the worker observes the request.
    let view = h.orchestrator.get_status(&ghost_task).await.unwrap();
    assert_eq!(view.state, TaskState::Active);
    assert_matches!(
        h.queue.heartbeat(&ghost_task, "w1").await.unwrap(),
        Lease::RevokeRequested(RevokeRequest {
            terminate: true,
            signal: RevokeSignal::Sigterm,
        })
    );
}

#[tokio::test]
async fn task_stops_being_a_ghost_once_progress_exists() {
    let h = harness();
    let (job_id, _) = orphan_task(&h).await;
    assert_eq!(h.orchestrator.list_ghosts().await.unwrap().len(), 1);

    h.orchestrator.progress().init(&job_id, 1, "late init").await.unwrap();
    assert!(h.orchestrator.list_ghosts().await.unwrap().is_empty());
}

#[tokio::test]
async fn tasks_without_a_recognizable_job_are_ignored() {
    let h = harness();
    h.orchestrator
        .dispatcher()
        .submit_single(
            &JobId::from("x"),
            TaskKind::RunJokboAnalysis,
            TaskArgs::new(vec![json!(42)], Map::new()),
        )
        .await
        .unwrap();
    assert!(h.orchestrator.list_ghosts().await.unwrap().is_empty());
}

#[tokio::test]
async fn unreadable_progress_is_skipped_not_reported() {
    let h = harness();
    orphan_task(&h).await;
    h.store.fail_operation("get_progress").await;
    assert!(h.orchestrator.list_ghosts().await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Stalls
// ---------------------------------------------------------------------------

#[tokio::test]
async fn idle_job_is_reported_as_stalled() {
    let h = harness();
    let stalled = JobId::generate();
    let fresh = JobId::generate();
    let done = JobId::generate();
    h.store.put_progress(record_idle_for(&stalled, 10, 4, 15)).await;
    h.store.put_progress(record_idle_for(&fresh, 10, 4, 1)).await;
    h.store.put_progress(record_idle_for(&done, 10, 10, 60)).await;

    let found = h.orchestrator.list_stalled(Some(10)).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].job_id, stalled);
    assert_eq!(found[0].completed, 4);
    assert_eq!(found[0].total, 10);
    assert!(found[0].idle_seconds >= 15 * 60);

    assert!(h.orchestrator.list_stalled(Some(30)).await.unwrap().is_empty());
}

#[tokio::test]
async fn malformed_progress_is_never_stalled() {
    let h = harness();
    h.store
        .put_progress(record_idle_for(&JobId::generate(), 0, 0, 120))
        .await;
    h.store
        .put_progress(record_idle_for(&JobId::generate(), 3, 7, 120))
        .await;
    assert!(h.orchestrator.list_stalled(Some(1)).await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Progress under concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_increments_are_all_counted() {
    let h = harness();
    let job_id = JobId::generate();
    h.orchestrator.progress().init(&job_id, 50, "start").await.unwrap();

    let tracker = Arc::new(h.orchestrator.progress().clone());
    let updates = (0..40).map(|i| {
        let tracker = Arc::clone(&tracker);
        let job_id = job_id.clone();
        tokio::spawn(async move {
            let message = format!("unit {i} done");
            tracker
                .update(&job_id, ProgressUpdate::Increment(1), Some(message.as_str()))
                .await
        })
    });
    for joined in futures::future::join_all(updates).await {
        joined.unwrap().unwrap();
    }

    let snapshot = h.orchestrator.progress().read(&job_id).await.unwrap();
    assert_eq!(snapshot.completed, 40);
    assert_eq!(snapshot.percent, 80);
}

#[tokio::test]
async fn increments_past_total_clamp() {
    let h = harness();
    let job_id = JobId::generate();
    h.orchestrator.progress().init(&job_id, 3, "start").await.unwrap();
    for _ in 0..5 {
        h.orchestrator
            .progress()
            .update(&job_id, ProgressUpdate::Increment(1), None)
            .await
            .unwrap();
    }
    let snapshot = h.orchestrator.progress().read(&job_id).await.unwrap();
    assert_eq!(snapshot.completed, 3);
    assert_eq!(snapshot.percent, 100);
}

// ---------------------------------------------------------------------------
// Periodic loops
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retention_purges_expired_jobs_and_settled_tasks() {
    let h = harness();
    let alice = Requester::user("alice");
    let started = h
        .orchestrator
        .submit_job(&alice, single_input(AnalysisMode::ExamOnly))
        .await
        .unwrap();
    h.queue
        .finish(&started.task_id, TaskOutcome::Succeeded(json!({})))
        .await
        .unwrap();
    h.store.record_final(&started.job_id, &json!({})).await.unwrap();

    let sweep = RetentionSweep::new(
        h.orchestrator.registry().clone(),
        h.orchestrator.dispatcher().clone(),
        Duration::from_secs(3600),
        Duration::from_secs(60),
    );

    let report = sweep.sweep_once(Utc::now()).await.unwrap();
    assert!(report.is_empty());

    let later = Utc::now() + chrono::Duration::hours(2);
    let report = sweep.sweep_once(later).await.unwrap();
    assert_eq!(report.jobs_deleted, 1);
    assert_eq!(report.tasks_purged, 1);

    assert!(h.orchestrator.registry().find(&started.job_id).await.unwrap().is_none());
    assert!(h.store.get_final(&started.job_id).await.unwrap().is_none());
    assert!(!h
        .orchestrator
        .registry()
        .is_user_job("alice", &started.job_id)
        .await
        .unwrap());
}

#[tokio::test]
async fn watchdog_reports_without_remediating() {
    let h = harness();
    let (ghost_job, ghost_task) = orphan_task(&h).await;
    let stalled = JobId::generate();
    h.store.put_progress(record_idle_for(&stalled, 2, 1, 45)).await;

    let watchdog = Watchdog::new(
        h.orchestrator.reconciler().clone(),
        Duration::from_secs(30 * 60),
        Duration::from_secs(60),
    );
    let findings = watchdog.check_once().await.unwrap();
    assert_eq!(findings.ghosts.len(), 1);
    assert_eq!(findings.ghosts[0].job_id, ghost_job);
    assert_eq!(findings.stalled.len(), 1);
    assert_eq!(findings.stalled[0].job_id, stalled);

    assert!(!h.store.is_cancelled(&ghost_job).await.unwrap());
    let view = h.orchestrator.get_status(&ghost_task).await.unwrap();
    assert_eq!(view.state, TaskState::Scheduled);
}

#[tokio::test]
async fn background_tasks_stop_on_shutdown() {
    let h = harness();
    h.orchestrator
        .submit_job(&Requester::user("alice"), batch_input(2, 1))
        .await
        .unwrap();
    let tasks = jokbo_orchestrator::background::BackgroundTasks::spawn(&h.orchestrator);
    tokio::time::sleep(Duration::from_millis(20)).await;
    tokio::time::timeout(Duration::from_secs(2), tasks.shutdown(Duration::from_secs(1)))
        .await
        .unwrap();
}
