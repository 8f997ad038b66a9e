#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use jokbo_core::error::CoreError;
use jokbo_core::job::{InputRefs, NewJob};
use jokbo_core::mode::{AnalysisMode, ModelTier};
use jokbo_core::quota::QuotaPolicy;
use jokbo_core::task::QUEUE_ANALYSIS;
use jokbo_orchestrator::file_refs::{FileRefStore, NoopFileRefs};
use jokbo_orchestrator::queue::{ClaimedTask, MemoryTaskQueue, TaskQueue};
use jokbo_orchestrator::store::MemoryJobStore;
use jokbo_orchestrator::{Orchestrator, OrchestratorConfig};

/// An orchestrator over in-memory backends, with handles to both.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<MemoryJobStore>,
    pub queue: Arc<MemoryTaskQueue>,
}

pub fn harness() -> Harness {
    harness_with(OrchestratorConfig::default(), Arc::new(NoopFileRefs))
}

pub fn harness_with(config: OrchestratorConfig, file_refs: Arc<dyn FileRefStore>) -> Harness {
    let store = Arc::new(MemoryJobStore::new());
    let queue = Arc::new(MemoryTaskQueue::new());
    let orchestrator = Orchestrator::new(store.clone(), queue.clone(), file_refs, config);
    Harness {
        orchestrator,
        store,
        queue,
    }
}

pub fn config_with_policy(policy: QuotaPolicy) -> OrchestratorConfig {
    OrchestratorConfig {
        quota_policy: policy,
        ..OrchestratorConfig::default()
    }
}

pub fn keys() -> Vec<String> {
    vec![QUEUE_ANALYSIS.to_string()]
}

pub async fn claim(queue: &MemoryTaskQueue, worker: &str) -> ClaimedTask {
    queue
        .claim(worker, &keys())
        .await
        .unwrap()
        .expect("a claimable task")
}

pub fn batch_input(primary: usize, counterpart: usize) -> NewJob {
    NewJob {
        mode: AnalysisMode::Batch,
        owner_user_id: None,
        input_refs: InputRefs {
            primary: (0..primary).map(|i| format!("jokbo/{i}.pdf")).collect(),
            counterpart: (0..counterpart).map(|i| format!("lesson/{i}.pdf")).collect(),
        },
        model_tier: ModelTier::Flash,
        multi_api: false,
        min_relevance: Some(80),
        is_batch: true,
        estimated_units: None,
    }
}

pub fn single_input(mode: AnalysisMode) -> NewJob {
    NewJob {
        mode,
        owner_user_id: None,
        input_refs: InputRefs {
            primary: vec!["jokbo/a.pdf".into()],
            counterpart: vec!["lesson/a.pdf".into()],
        },
        model_tier: ModelTier::Pro,
        multi_api: true,
        min_relevance: None,
        is_batch: false,
        estimated_units: None,
    }
}

/// A file store whose refresh always fails.
pub struct BrokenFileRefs;

#[async_trait]
impl FileRefStore for BrokenFileRefs {
    async fn refresh_ttls(&self, _keys: &[String]) -> Result<(), CoreError> {
        Err(CoreError::StorageUnavailable("file store offline".into()))
    }
}
