//! Job lifecycle through the orchestrator facade: creation, start, batch
//! fan-out, ownership, quota, cancellation and deletion.

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use common::{
    batch_input, claim, config_with_policy, harness, harness_with, single_input, BrokenFileRefs,
};
use jokbo_core::error::CoreError;
use jokbo_core::mode::AnalysisMode;
use jokbo_core::progress::MSG_CANCEL_REQUESTED;
use jokbo_core::quota::QuotaPolicy;
use jokbo_core::task::{TaskKind, TaskState};
use jokbo_orchestrator::access::Requester;
use jokbo_orchestrator::queue::{TaskOutcome, TaskQueue};
use jokbo_orchestrator::service::JobListStatus;
use jokbo_orchestrator::store::JobStore;
use serde_json::json;

// ---------------------------------------------------------------------------
// Creation and start
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batch_fans_out_one_unit_per_primary_file() {
    let h = harness();
    let alice = Requester::user("alice");
    let started = h
        .orchestrator
        .submit_job(&alice, batch_input(3, 2))
        .await
        .unwrap();

    let batch = started.batch.clone().unwrap();
    assert_eq!(batch.task_ids.len(), 3);
    assert_eq!(started.task_id, batch.aggregation_task_id);

    let progress = h
        .orchestrator
        .get_progress(&alice, &started.job_id)
        .await
        .unwrap();
    assert_eq!(progress.total, 3);
    assert_eq!(progress.completed, 0);
    assert_eq!(progress.message, "Batch started: 3 units");

    let mut seen = Vec::new();
    for _ in 0..3 {
        let unit = claim(&h.queue, "w1").await;
        assert_eq!(unit.kind, TaskKind::BatchAnalyzeSingle);
        assert_eq!(unit.args[0], json!(started.job_id.as_str()));
        assert_eq!(unit.args[1], json!("jokbo-centric"));
        assert_eq!(unit.args[4], json!(["lesson/0.pdf", "lesson/1.pdf"]));
        assert_eq!(unit.kwargs["model_type"], json!("flash"));
        seen.push(unit.args[2].as_u64().unwrap());
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2]);

    let job = h.orchestrator.registry().get_metadata(&started.job_id).await.unwrap();
    assert!(!job.is_preflight);
    assert_eq!(job.bound_task_id.as_deref(), Some(batch.aggregation_task_id.as_str()));
}

#[tokio::test]
async fn single_job_dispatches_its_mode_kind() {
    let h = harness();
    let alice = Requester::user("alice");
    let started = h
        .orchestrator
        .submit_job(&alice, single_input(AnalysisMode::LessonCentric))
        .await
        .unwrap();
    assert!(started.batch.is_none());

    let task = claim(&h.queue, "w1").await;
    assert_eq!(task.task_id, started.task_id);
    assert_eq!(task.kind, TaskKind::RunLessonAnalysis);
    assert_eq!(task.args, vec![json!(started.job_id.as_str())]);
    assert_eq!(task.kwargs["multi_api"], json!(true));
    assert_eq!(task.kwargs["model_type"], json!("pro"));
}

#[tokio::test]
async fn starting_twice_conflicts() {
    let h = harness();
    let alice = Requester::user("alice");
    let started = h
        .orchestrator
        .submit_job(&alice, single_input(AnalysisMode::ExamOnly))
        .await
        .unwrap();
    assert_matches!(
        h.orchestrator.start_job(&alice, &started.job_id).await,
        Err(CoreError::Conflict(_))
    );
}

#[tokio::test]
async fn failed_ttl_refresh_does_not_block_creation() {
    let h = harness_with(Default::default(), Arc::new(BrokenFileRefs));
    let job = h
        .orchestrator
        .create_job(&Requester::user("alice"), single_input(AnalysisMode::JokboCentric))
        .await
        .unwrap();
    assert!(job.is_preflight);
    assert!(h
        .orchestrator
        .registry()
        .is_user_job("alice", &job.job_id)
        .await
        .unwrap());
}

#[tokio::test]
async fn dispatch_failure_rolls_back_submit() {
    let h = harness();
    let alice = Requester::user("alice");
    h.orchestrator.quota().set_balance("alice", 10).await.unwrap();
    h.queue.set_unavailable(true).await;

    let err = h
        .orchestrator
        .submit_job(&alice, batch_input(2, 1))
        .await
        .unwrap_err();
    assert_matches!(err, CoreError::DispatchFailure(_));

    assert_eq!(h.orchestrator.quota().get_balance("alice").await.unwrap(), Some(10));
    let listed = h
        .orchestrator
        .list_user_jobs(&alice, "alice", None, true)
        .await
        .unwrap();
    assert!(listed.is_empty());
    assert!(h.store.list_unfinished_progress().await.unwrap().is_empty());
}

#[tokio::test]
async fn dispatch_failure_on_start_leaves_a_draft() {
    let h = harness();
    let alice = Requester::user("alice");
    let job = h
        .orchestrator
        .create_job(&alice, single_input(AnalysisMode::ExamOnly))
        .await
        .unwrap();

    h.queue.set_unavailable(true).await;
    assert_matches!(
        h.orchestrator.start_job(&alice, &job.job_id).await,
        Err(CoreError::DispatchFailure(_))
    );

    let stored = h.orchestrator.registry().get_metadata(&job.job_id).await.unwrap();
    assert!(stored.is_draft());
    assert_matches!(
        h.orchestrator.progress().read(&job.job_id).await,
        Err(CoreError::NotFound { .. })
    );

    h.queue.set_unavailable(false).await;
    assert!(h.orchestrator.start_job(&alice, &job.job_id).await.is_ok());
}

// ---------------------------------------------------------------------------
// Quota
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exhausted_balance_refuses_creation() {
    let h = harness();
    h.orchestrator.quota().set_balance("alice", 0).await.unwrap();
    assert_matches!(
        h.orchestrator
            .create_job(&Requester::user("alice"), single_input(AnalysisMode::ExamOnly))
            .await,
        Err(CoreError::QuotaExhausted { balance: 0, .. })
    );
}

#[tokio::test]
async fn unreadable_balance_refuses_creation() {
    let h = harness();
    h.orchestrator.quota().set_balance("alice", 5).await.unwrap();
    h.store.fail_operation("get_balance").await;
    assert_matches!(
        h.orchestrator
            .create_job(&Requester::user("alice"), single_input(AnalysisMode::ExamOnly))
            .await,
        Err(CoreError::StorageUnavailable(_))
    );
    assert!(h.store.user_jobs("alice", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn start_debits_units_at_tier_rate() {
    let h = harness();
    let alice = Requester::user("alice");
    h.orchestrator.quota().set_balance("alice", 20).await.unwrap();

    let mut input = batch_input(3, 1);
    input.model_tier = jokbo_core::mode::ModelTier::Pro;
    let started = h.orchestrator.submit_job(&alice, input).await.unwrap();
    assert_eq!(started.charged, 12);
    assert_eq!(h.orchestrator.quota().get_balance("alice").await.unwrap(), Some(8));
}

#[tokio::test]
async fn overdraft_at_start_is_refused_and_refunded() {
    let h = harness();
    let alice = Requester::user("alice");
    h.orchestrator.quota().set_balance("alice", 2).await.unwrap();
    let job = h
        .orchestrator
        .create_job(&alice, batch_input(3, 1))
        .await
        .unwrap();

    assert_matches!(
        h.orchestrator.start_job(&alice, &job.job_id).await,
        Err(CoreError::QuotaExhausted { balance: 2, .. })
    );
    assert_eq!(h.orchestrator.quota().get_balance("alice").await.unwrap(), Some(2));
    assert!(h.queue.is_empty().await);
}

#[tokio::test]
async fn disabled_policy_admits_empty_balance() {
    let h = harness_with(
        config_with_policy(QuotaPolicy::Disabled),
        Arc::new(jokbo_orchestrator::file_refs::NoopFileRefs),
    );
    h.orchestrator.quota().set_balance("alice", 0).await.unwrap();
    let started = h
        .orchestrator
        .submit_job(&Requester::user("alice"), single_input(AnalysisMode::ExamOnly))
        .await
        .unwrap();
    assert_eq!(started.charged, 4);
    assert_eq!(h.orchestrator.quota().get_balance("alice").await.unwrap(), Some(-4));
}

// ---------------------------------------------------------------------------
// Ownership
// ---------------------------------------------------------------------------

#[tokio::test]
async fn other_users_are_forbidden_and_change_nothing() {
    let h = harness();
    let alice = Requester::user("alice");
    let bob = Requester::user("bob");
    let started = h
        .orchestrator
        .submit_job(&alice, single_input(AnalysisMode::ExamOnly))
        .await
        .unwrap();
    let id = &started.job_id;

    assert_matches!(h.orchestrator.get_result(&bob, id).await, Err(CoreError::Forbidden(_)));
    assert_matches!(h.orchestrator.get_progress(&bob, id).await, Err(CoreError::Forbidden(_)));
    assert_matches!(h.orchestrator.cancel_job(&bob, id).await, Err(CoreError::Forbidden(_)));
    assert_matches!(
        h.orchestrator.delete_job(&bob, id, true).await,
        Err(CoreError::Forbidden(_))
    );
    assert_matches!(
        h.orchestrator.list_user_jobs(&bob, "alice", None, false).await,
        Err(CoreError::Forbidden(_))
    );

    assert!(!h.store.is_cancelled(id).await.unwrap());
    assert!(h.orchestrator.registry().find(id).await.unwrap().is_some());
    let status = h.orchestrator.get_status(&started.task_id).await.unwrap();
    assert_eq!(status.state, TaskState::Scheduled);
}

#[tokio::test]
async fn anonymous_jobs_need_an_operator() {
    let h = harness();
    let job = h
        .orchestrator
        .create_job(&Requester::Operator, single_input(AnalysisMode::ExamOnly))
        .await
        .unwrap();
    assert!(job.owner_user_id.is_none());
    assert_matches!(
        h.orchestrator
            .start_job(&Requester::user("alice"), &job.job_id)
            .await,
        Err(CoreError::Forbidden(_))
    );
    assert!(h
        .orchestrator
        .start_job(&Requester::Operator, &job.job_id)
        .await
        .is_ok());
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelling_a_draft_deletes_it() {
    let h = harness();
    let alice = Requester::user("alice");
    let job = h
        .orchestrator
        .create_job(&alice, single_input(AnalysisMode::ExamOnly))
        .await
        .unwrap();
    h.store.record_partial(&job.job_id, 0, &json!({"p": 1})).await.unwrap();

    let outcome = h.orchestrator.cancel_job(&alice, &job.job_id).await.unwrap();
    assert!(!outcome.revoked);
    assert!(outcome.draft_deleted);

    assert!(h.orchestrator.registry().find(&job.job_id).await.unwrap().is_none());
    assert!(h.store.get_partial(&job.job_id, 0).await.unwrap().is_none());
    assert!(!h.store.is_cancelled(&job.job_id).await.unwrap());
}

#[tokio::test]
async fn cancelling_a_running_batch_revokes_everything() {
    let h = harness();
    let alice = Requester::user("alice");
    let started = h
        .orchestrator
        .submit_job(&alice, batch_input(3, 1))
        .await
        .unwrap();
    let batch = started.batch.clone().unwrap();

    let running = claim(&h.queue, "w1").await;
    h.queue.mark_started(&running.task_id, "w1").await.unwrap();

    let outcome = h.orchestrator.cancel_job(&alice, &started.job_id).await.unwrap();
    assert!(outcome.revoked);
    assert!(!outcome.draft_deleted);
    assert!(h.store.is_cancelled(&started.job_id).await.unwrap());

    let progress = h
        .orchestrator
        .get_progress(&alice, &started.job_id)
        .await
        .unwrap();
    assert_eq!(progress.message, MSG_CANCEL_REQUESTED);

    for task_id in &batch.task_ids {
        let view = h.orchestrator.get_status(task_id).await.unwrap();
        if *task_id == running.task_id {
            // Running units stop at their next heartbeat.
            assert_eq!(view.state, TaskState::Active);
        } else {
            assert_eq!(view.state, TaskState::Revoked);
        }
    }
    let agg = h.orchestrator.get_status(&batch.aggregation_task_id).await.unwrap();
    assert_eq!(agg.state, TaskState::Revoked);

    // A second cancel observes the same state.
    let again = h.orchestrator.cancel_job(&alice, &started.job_id).await.unwrap();
    assert!(!again.draft_deleted);
    assert!(h.store.is_cancelled(&started.job_id).await.unwrap());
}

#[tokio::test]
async fn cancel_survives_a_queue_outage() {
    let h = harness();
    let alice = Requester::user("alice");
    let started = h
        .orchestrator
        .submit_job(&alice, single_input(AnalysisMode::ExamOnly))
        .await
        .unwrap();

    h.queue.set_unavailable(true).await;
    let outcome = h.orchestrator.cancel_job(&alice, &started.job_id).await.unwrap();
    assert!(!outcome.revoked);
    assert!(h.store.is_cancelled(&started.job_id).await.unwrap());
}

// ---------------------------------------------------------------------------
// Deletion and listing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_revokes_running_work_when_asked() {
    let h = harness();
    let alice = Requester::user("alice");
    let started = h
        .orchestrator
        .submit_job(&alice, single_input(AnalysisMode::ExamOnly))
        .await
        .unwrap();

    let outcome = h
        .orchestrator
        .delete_job(&alice, &started.job_id, true)
        .await
        .unwrap();
    assert!(outcome.revoked);
    assert!(h.orchestrator.registry().find(&started.job_id).await.unwrap().is_none());
    let view = h.orchestrator.get_status(&started.task_id).await.unwrap();
    assert_eq!(view.state, TaskState::Revoked);
}

#[tokio::test]
async fn delete_falls_back_to_index_membership() {
    let h = harness();
    let job = h
        .orchestrator
        .create_job(&Requester::Operator, single_input(AnalysisMode::ExamOnly))
        .await
        .unwrap();
    h.orchestrator
        .registry()
        .add_user_job("carol", &job.job_id)
        .await
        .unwrap();

    let outcome = h
        .orchestrator
        .delete_job(&Requester::user("carol"), &job.job_id, false)
        .await
        .unwrap();
    assert!(!outcome.revoked);
    assert!(h.orchestrator.registry().find(&job.job_id).await.unwrap().is_none());
}

#[tokio::test]
async fn user_job_list_reports_status_per_entry() {
    let h = harness();
    let alice = Requester::user("alice");

    let draft = h
        .orchestrator
        .create_job(&alice, single_input(AnalysisMode::ExamOnly))
        .await
        .unwrap();
    let done = h
        .orchestrator
        .submit_job(&alice, single_input(AnalysisMode::ExamOnly))
        .await
        .unwrap();
    let cancelled = h
        .orchestrator
        .submit_job(&alice, single_input(AnalysisMode::PartialJokbo))
        .await
        .unwrap();

    let task = claim(&h.queue, "w1").await;
    assert_eq!(task.task_id, done.task_id);
    h.queue
        .finish(&task.task_id, TaskOutcome::Succeeded(json!({"file": "out.pdf"})))
        .await
        .unwrap();
    h.store.record_final(&done.job_id, &json!({"file": "out.pdf"})).await.unwrap();
    h.orchestrator.cancel_job(&alice, &cancelled.job_id).await.unwrap();

    let listed = h
        .orchestrator
        .list_user_jobs(&alice, "alice", None, false)
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);
    let by_id = |id: &jokbo_core::types::JobId| listed.iter().find(|e| &e.job_id == id).unwrap();
    assert_eq!(by_id(&done.job_id).status, JobListStatus::Success);
    assert!(by_id(&done.job_id).has_result);
    assert_eq!(by_id(&cancelled.job_id).status, JobListStatus::Cancelled);

    let with_drafts = h
        .orchestrator
        .list_user_jobs(&alice, "alice", None, true)
        .await
        .unwrap();
    assert_eq!(with_drafts.len(), 3);
    let entry = with_drafts.iter().find(|e| e.job_id == draft.job_id).unwrap();
    assert!(entry.draft);
    assert_eq!(entry.status, JobListStatus::Draft);
    assert!(entry.progress.is_none());
}

#[tokio::test]
async fn result_is_not_found_until_recorded() {
    let h = harness();
    let alice = Requester::user("alice");
    let started = h
        .orchestrator
        .submit_job(&alice, single_input(AnalysisMode::ExamOnly))
        .await
        .unwrap();
    assert_matches!(
        h.orchestrator.get_result(&alice, &started.job_id).await,
        Err(CoreError::NotFound { entity: "Result", .. })
    );
    h.store
        .record_final(&started.job_id, &json!({"file": "x.pdf"}))
        .await
        .unwrap();
    assert_eq!(
        h.orchestrator.get_result(&alice, &started.job_id).await.unwrap(),
        json!({"file": "x.pdf"})
    );
}
