//! End-to-end execution through the worker runtime over in-memory
//! backends: handlers, retries, joins, cancellation and time limits.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use common::{batch_input, count, harness, harness_with, single_input, Behavior};
use jokbo_core::error::CoreError;
use jokbo_core::task::{RevokeSignal, TaskKind, TaskStatus, TimeLimits, QUEUE_ANALYSIS};
use jokbo_orchestrator::access::Requester;
use jokbo_orchestrator::queue::{TaskQueue, TaskSpec};
use jokbo_orchestrator::service::RevokeTarget;
use jokbo_orchestrator::store::JobStore;
use jokbo_orchestrator::OrchestratorConfig;
use jokbo_worker::runtime::{Execution, HARD_LIMIT_EXCEEDED, SOFT_LIMIT_EXCEEDED};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const SETTLE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Happy paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_job_analyzes_every_primary_file() {
    let h = harness();
    let alice = Requester::user("alice");
    let started = h.orchestrator.submit_job(&alice, single_input(2)).await.unwrap();

    let executions = h.drain().await;
    assert_eq!(executions, vec![Execution::Succeeded]);

    let result = h.orchestrator.get_result(&alice, &started.job_id).await.unwrap();
    assert_eq!(result["mode"], json!("jokbo-centric"));
    let outputs = result["outputs"].as_array().unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[1]["key"], json!("jokbo/1.pdf"));
    assert_eq!(outputs[1]["result"]["counterparts"], json!(1));

    let progress = h.orchestrator.get_progress(&alice, &started.job_id).await.unwrap();
    assert_eq!(progress.completed, 2);
    assert_eq!(progress.percent, 100);
    assert_eq!(progress.message, "Completed");

    let status = h.orchestrator.get_status(&started.task_id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Success);
    assert_eq!(status.result.unwrap()["files_generated"], json!(2));

    // One counterpart and two primaries.
    assert_eq!(h.documents.fetches(), 3);
}

#[tokio::test]
async fn every_unit_failing_once_still_aggregates_exactly_once() {
    let h = harness();
    let alice = Requester::user("alice");
    for i in 0..3 {
        h.analyzer
            .set(&format!("jokbo/{i}.pdf"), Behavior::FlakyTimes(1))
            .await;
    }
    let started = h.orchestrator.submit_job(&alice, batch_input(3, 1)).await.unwrap();

    let executions = h.drain().await;
    assert_eq!(executions.len(), 7);
    assert_eq!(
        count(&executions, &Execution::Retried { delay: Duration::ZERO }),
        3
    );
    // Three units and exactly one aggregation, which runs last.
    assert_eq!(count(&executions, &Execution::Succeeded), 4);
    assert_eq!(executions.last(), Some(&Execution::Succeeded));
    assert_eq!(h.analyzer.calls(), 6);

    let result = h.orchestrator.get_result(&alice, &started.job_id).await.unwrap();
    assert_eq!(result["mode"], json!("batch"));
    let units = result["units"].as_array().unwrap();
    assert_eq!(units.len(), 3);
    assert_eq!(units[1]["result"]["primary"], json!("jokbo/1.pdf"));
    assert!(result["failed"].as_array().unwrap().is_empty());

    let progress = h.orchestrator.get_progress(&alice, &started.job_id).await.unwrap();
    assert_eq!(progress.completed, 3);
    assert_eq!(progress.percent, 100);
    assert_eq!(progress.message, "Completed");

    let aggregation = h.orchestrator.get_status(&started.task_id).await.unwrap();
    assert_eq!(aggregation.status, TaskStatus::Success);

    // The shared counterpart is fetched once for the whole batch.
    assert_eq!(h.documents.fetches(), 4);
}

#[tokio::test]
async fn rejected_unit_is_listed_in_the_aggregate() {
    let h = harness();
    let alice = Requester::user("alice");
    h.analyzer.set("jokbo/0.pdf", Behavior::Reject).await;
    let started = h.orchestrator.submit_job(&alice, batch_input(3, 1)).await.unwrap();

    let executions = h.drain().await;
    assert!(executions.contains(&Execution::Failed(
        "Analysis rejected: 422 unreadable pdf".into()
    )));
    assert_eq!(count(&executions, &Execution::Succeeded), 3);

    let result = h.orchestrator.get_result(&alice, &started.job_id).await.unwrap();
    assert_eq!(result["units"].as_array().unwrap().len(), 2);
    let failed = result["failed"].as_array().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["unit"], json!(0));
    assert_eq!(failed[0]["state"], json!("failed"));
}

#[tokio::test]
async fn batch_with_no_successful_unit_fails() {
    let h = harness();
    let alice = Requester::user("alice");
    h.analyzer.set("jokbo/0.pdf", Behavior::Reject).await;
    h.analyzer.set("jokbo/1.pdf", Behavior::Reject).await;
    let started = h.orchestrator.submit_job(&alice, batch_input(2, 0)).await.unwrap();

    let executions = h.drain().await;
    assert_eq!(executions.last(), Some(&Execution::Failed("All 2 units failed".into())));

    assert_matches!(
        h.orchestrator.get_result(&alice, &started.job_id).await,
        Err(CoreError::NotFound { .. })
    );
    let progress = h.orchestrator.get_progress(&alice, &started.job_id).await.unwrap();
    assert_eq!(progress.message, "All 2 units failed");
    let aggregation = h.orchestrator.get_status(&started.task_id).await.unwrap();
    assert_eq!(aggregation.status, TaskStatus::Failure);
}

#[tokio::test]
async fn retries_run_out() {
    let h = harness_with(OrchestratorConfig {
        max_task_retries: 1,
        ..OrchestratorConfig::default()
    });
    let alice = Requester::user("alice");
    h.analyzer.set("jokbo/0.pdf", Behavior::FlakyTimes(5)).await;
    let started = h.orchestrator.submit_job(&alice, single_input(1)).await.unwrap();

    let executions = h.drain().await;
    assert_eq!(
        executions,
        vec![
            Execution::Retried { delay: Duration::ZERO },
            Execution::Failed("Analyzer temporarily unavailable: 503 Service Unavailable".into()),
        ]
    );
    let status = h.orchestrator.get_status(&started.task_id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Failure);
    assert_eq!(status.attempts, 1);
}

// ---------------------------------------------------------------------------
// Idempotency and recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn recorded_unit_is_not_analyzed_again() {
    let h = harness();
    let alice = Requester::user("alice");
    let started = h.orchestrator.submit_job(&alice, batch_input(2, 0)).await.unwrap();
    h.store
        .record_partial(&started.job_id, 0, &json!({ "primary": "jokbo/0.pdf", "cached": true }))
        .await
        .unwrap();

    let executions = h.drain().await;
    assert_eq!(count(&executions, &Execution::Succeeded), 3);
    assert_eq!(h.analyzer.calls(), 1);

    let result = h.orchestrator.get_result(&alice, &started.job_id).await.unwrap();
    assert_eq!(result["units"][0]["result"]["cached"], json!(true));
}

#[tokio::test]
async fn unit_of_a_dead_worker_is_requeued_and_joined() {
    let h = harness();
    let alice = Requester::user("alice");
    let started = h.orchestrator.submit_job(&alice, batch_input(2, 0)).await.unwrap();

    let orphan = h
        .queue
        .claim("dead-worker", &[QUEUE_ANALYSIS.to_string()])
        .await
        .unwrap()
        .expect("a unit to claim");
    tokio::time::sleep(Duration::from_millis(250)).await;

    let sweep = h
        .queue
        .requeue_lost(h.runtime.settings().lease_timeout)
        .await
        .unwrap();
    assert_eq!(sweep.requeued, 1);

    let executions = h.drain().await;
    assert_eq!(count(&executions, &Execution::Succeeded), 3);

    let rerun = h.orchestrator.get_status(&orphan.task_id).await.unwrap();
    assert_eq!(rerun.status, TaskStatus::Success);
    assert_eq!(rerun.worker.as_deref(), Some("w1"));
    let result = h.orchestrator.get_result(&alice, &started.job_id).await.unwrap();
    assert_eq!(result["units"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn task_without_job_id_fails() {
    let h = harness();
    let spec = TaskSpec::new(TaskKind::RunExamOnly, None).with_args(vec![json!("not an id!")]);
    let task_id = h.queue.enqueue(spec).await.unwrap();

    let execution = h.runtime.poll_once().await.unwrap();
    assert_eq!(execution, Some(Execution::Failed("Task carries no job id".into())));
    let status = h.orchestrator.get_status(&task_id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Failure);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_flag_stops_unit_at_first_checkpoint() {
    let h = harness();
    let alice = Requester::user("alice");
    let started = h.orchestrator.submit_job(&alice, single_input(1)).await.unwrap();
    h.orchestrator
        .cancellation()
        .request_cancel(&started.job_id)
        .await
        .unwrap();

    let execution = h.runtime.poll_once().await.unwrap();
    assert_eq!(execution, Some(Execution::Revoked("Job cancelled".into())));
    assert_eq!(h.analyzer.calls(), 0);
    let status = h.orchestrator.get_status(&started.task_id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Revoked);
}

#[tokio::test]
async fn cancelled_job_stops_cooperating_unit() {
    let h = harness();
    let alice = Requester::user("alice");
    h.analyzer
        .set("jokbo/0.pdf", Behavior::Slow(Duration::from_secs(10)))
        .await;
    let started = h.orchestrator.submit_job(&alice, single_input(1)).await.unwrap();

    let runtime = h.runtime.clone();
    let running = tokio::spawn(async move { runtime.poll_once().await });
    h.analyzer.entered.notified().await;

    h.orchestrator.cancel_job(&alice, &started.job_id).await.unwrap();

    let execution = tokio::time::timeout(SETTLE, running)
        .await
        .expect("unit settles")
        .unwrap()
        .unwrap();
    assert_eq!(execution, Some(Execution::Revoked("Revoked".into())));
    let status = h.orchestrator.get_status(&started.task_id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Revoked);
    assert_matches!(
        h.orchestrator.get_result(&alice, &started.job_id).await,
        Err(CoreError::NotFound { .. })
    );
}

#[tokio::test]
async fn sigterm_escalates_after_grace_period() {
    let h = harness();
    let alice = Requester::user("alice");
    h.analyzer
        .set("jokbo/0.pdf", Behavior::Stubborn(Duration::from_secs(10)))
        .await;
    let started = h.orchestrator.submit_job(&alice, single_input(1)).await.unwrap();

    let runtime = h.runtime.clone();
    let running = tokio::spawn(async move { runtime.poll_once().await });
    h.analyzer.entered.notified().await;

    h.orchestrator.cancel_job(&alice, &started.job_id).await.unwrap();

    let execution = tokio::time::timeout(SETTLE, running)
        .await
        .expect("unit is terminated")
        .unwrap()
        .unwrap();
    assert_eq!(execution, Some(Execution::Revoked("Terminated (SIGTERM)".into())));
}

#[tokio::test]
async fn sigkill_aborts_immediately() {
    let h = harness();
    let alice = Requester::user("alice");
    h.analyzer
        .set("jokbo/0.pdf", Behavior::Stubborn(Duration::from_secs(10)))
        .await;
    let started = h.orchestrator.submit_job(&alice, single_input(1)).await.unwrap();

    let runtime = h.runtime.clone();
    let running = tokio::spawn(async move { runtime.poll_once().await });
    h.analyzer.entered.notified().await;

    h.orchestrator
        .revoke(RevokeTarget::Task(started.task_id.clone()), true, RevokeSignal::Sigkill)
        .await;

    let execution = tokio::time::timeout(SETTLE, running)
        .await
        .expect("unit is killed")
        .unwrap()
        .unwrap();
    assert_eq!(execution, Some(Execution::Revoked("Terminated (SIGKILL)".into())));
    let status = h.orchestrator.get_status(&started.task_id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Revoked);
}

// ---------------------------------------------------------------------------
// Time limits
// ---------------------------------------------------------------------------

async fn enqueue_limited(h: &common::Harness, limits: TimeLimits) -> String {
    let job = h
        .orchestrator
        .create_job(&Requester::user("alice"), single_input(1))
        .await
        .unwrap();
    let spec = TaskSpec::new(TaskKind::RunJokboAnalysis, Some(job.job_id.clone()))
        .with_args(vec![json!(job.job_id.as_str())])
        .with_limits(limits);
    h.queue.enqueue(spec).await.unwrap()
}

#[tokio::test]
async fn soft_limit_cancels_cooperating_unit() {
    let h = harness();
    h.analyzer
        .set("jokbo/0.pdf", Behavior::Slow(Duration::from_secs(10)))
        .await;
    let task_id = enqueue_limited(
        &h,
        TimeLimits {
            soft: Duration::from_millis(50),
            hard: Duration::from_secs(5),
        },
    )
    .await;

    let execution = tokio::time::timeout(SETTLE, h.runtime.poll_once())
        .await
        .expect("soft limit fires")
        .unwrap();
    assert_eq!(execution, Some(Execution::Failed(SOFT_LIMIT_EXCEEDED.into())));
    let status = h.orchestrator.get_status(&task_id).await.unwrap();
    assert_eq!(status.error.as_deref(), Some(SOFT_LIMIT_EXCEEDED));
}

#[tokio::test]
async fn hard_limit_aborts_stubborn_unit() {
    let h = harness();
    h.analyzer
        .set("jokbo/0.pdf", Behavior::Stubborn(Duration::from_secs(10)))
        .await;
    let task_id = enqueue_limited(
        &h,
        TimeLimits {
            soft: Duration::from_millis(30),
            hard: Duration::from_millis(100),
        },
    )
    .await;

    let execution = tokio::time::timeout(SETTLE, h.runtime.poll_once())
        .await
        .expect("hard limit fires")
        .unwrap();
    assert_eq!(execution, Some(Execution::Failed(HARD_LIMIT_EXCEEDED.into())));
    let status = h.orchestrator.get_status(&task_id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Failure);
}

#[tokio::test]
async fn competing_workers_split_a_batch_without_double_work() {
    let h = harness();
    let alice = Requester::user("alice");
    let started = h.orchestrator.submit_job(&alice, batch_input(3, 1)).await.unwrap();

    let w2 = h.worker("w2");
    let per_worker = futures::future::join_all([common::drain(&h.runtime), common::drain(&w2)]).await;
    let executions: Vec<Execution> = per_worker.into_iter().flatten().collect();

    assert_eq!(count(&executions, &Execution::Succeeded), 4);
    assert_eq!(h.analyzer.calls(), 3);
    let result = h.orchestrator.get_result(&alice, &started.job_id).await.unwrap();
    assert_eq!(result["units"].as_array().unwrap().len(), 3);
}

// ---------------------------------------------------------------------------
// Run loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_loop_completes_batch_and_stops_on_cancel() {
    let h = harness();
    let alice = Requester::user("alice");
    let started = h.orchestrator.submit_job(&alice, batch_input(4, 1)).await.unwrap();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(h.runtime.clone().run(cancel.clone()));

    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if h.orchestrator.get_result(&alice, &started.job_id).await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(finished.is_ok(), "batch did not complete");

    cancel.cancel();
    tokio::time::timeout(SETTLE, handle)
        .await
        .expect("runtime stops")
        .unwrap();

    let progress = h.orchestrator.get_progress(&alice, &started.job_id).await.unwrap();
    assert_eq!(progress.percent, 100);
    assert_eq!(h.analyzer.calls(), 4);
}
