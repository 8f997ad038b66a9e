#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jokbo_core::error::CoreError;
use jokbo_core::job::{InputRefs, NewJob};
use jokbo_core::mode::{AnalysisMode, ModelTier};
use jokbo_core::task::QUEUE_ANALYSIS;
use jokbo_orchestrator::cancellation::CancelProbe;
use jokbo_orchestrator::file_refs::NoopFileRefs;
use jokbo_orchestrator::queue::MemoryTaskQueue;
use jokbo_orchestrator::store::MemoryJobStore;
use jokbo_orchestrator::{Orchestrator, OrchestratorConfig};
use jokbo_worker::analyzer::{AnalysisRequest, Analyzer, AnalyzerError};
use jokbo_worker::backoff::RetryBackoff;
use jokbo_worker::documents::{Document, DocumentCache, DocumentSource};
use jokbo_worker::handlers::{HandlerRegistry, WorkerDeps};
use jokbo_worker::runtime::{Execution, RuntimeSettings};
use jokbo_worker::WorkerRuntime;
use serde_json::{json, Value};
use tokio::sync::{Mutex, Notify};

/// How the fake analyzer reacts to a primary document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Fail transiently this many times, then succeed.
    FlakyTimes(u32),
    Reject,
    /// Work for a while, stopping early when the unit's token is cancelled.
    Slow(Duration),
    /// Work for a while and ignore cancellation.
    Stubborn(Duration),
}

/// Analyzer double keyed by primary document.
#[derive(Default)]
pub struct FakeAnalyzer {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: AtomicUsize,
    pub entered: Notify,
}

impl FakeAnalyzer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set(&self, key: &str, behavior: Behavior) {
        self.behaviors.lock().await.insert(key.to_string(), behavior);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Analyzer for FakeAnalyzer {
    async fn analyze(
        &self,
        request: &AnalysisRequest,
        probe: &CancelProbe,
    ) -> Result<Value, AnalyzerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();

        let key = request.primary.key.clone();
        let behavior = self.behaviors.lock().await.get(&key).copied();
        match behavior {
            Some(Behavior::FlakyTimes(n)) if n > 0 => {
                self.behaviors
                    .lock()
                    .await
                    .insert(key.clone(), Behavior::FlakyTimes(n - 1));
                return Err(AnalyzerError::Transient("503 Service Unavailable".into()));
            }
            Some(Behavior::Reject) => {
                return Err(AnalyzerError::Rejected("422 unreadable pdf".into()));
            }
            Some(Behavior::Slow(work)) => {
                tokio::select! {
                    _ = probe.token().cancelled() => return Err(AnalyzerError::Cancelled),
                    _ = tokio::time::sleep(work) => {}
                }
            }
            Some(Behavior::Stubborn(work)) => tokio::time::sleep(work).await,
            _ => {}
        }

        Ok(json!({
            "primary": key,
            "counterparts": request.counterparts.len(),
            "mode": request.options.mode,
        }))
    }
}

/// Serves any key with its own name as content.
#[derive(Default)]
pub struct EchoDocuments {
    fetches: AtomicUsize,
}

impl EchoDocuments {
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentSource for EchoDocuments {
    async fn fetch(&self, key: &str) -> Result<Document, CoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(Document::new(key, key.as_bytes().to_vec()))
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<MemoryJobStore>,
    pub queue: Arc<MemoryTaskQueue>,
    pub analyzer: Arc<FakeAnalyzer>,
    pub documents: Arc<EchoDocuments>,
    pub runtime: WorkerRuntime,
}

pub fn settings(worker: &str) -> RuntimeSettings {
    RuntimeSettings {
        worker_name: worker.to_string(),
        concurrency: 2,
        queues: vec![QUEUE_ANALYSIS.to_string()],
        poll_interval: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(20),
        lease_timeout: Duration::from_millis(200),
        terminate_grace: Duration::from_millis(100),
        backoff: RetryBackoff::with_initial(Duration::ZERO),
    }
}

pub fn harness() -> Harness {
    harness_with(OrchestratorConfig::default())
}

pub fn harness_with(config: OrchestratorConfig) -> Harness {
    let store = Arc::new(MemoryJobStore::new());
    let queue = Arc::new(MemoryTaskQueue::new());
    let orchestrator =
        Orchestrator::new(store.clone(), queue.clone(), Arc::new(NoopFileRefs), config);
    let analyzer = FakeAnalyzer::new();
    let documents = Arc::new(EchoDocuments::default());
    let deps = WorkerDeps::new(
        &orchestrator,
        analyzer.clone(),
        documents.clone(),
        DocumentCache::new(16),
    );
    let runtime = WorkerRuntime::new(
        queue.clone(),
        HandlerRegistry::with_defaults(),
        deps,
        settings("w1"),
    );
    Harness {
        orchestrator,
        store,
        queue,
        analyzer,
        documents,
        runtime,
    }
}

impl Harness {
    /// Execute claimable tasks until none is left.
    pub async fn drain(&self) -> Vec<Execution> {
        drain(&self.runtime).await
    }

    /// Another worker sharing this harness's backends and collaborators.
    pub fn worker(&self, name: &str) -> WorkerRuntime {
        let deps = WorkerDeps::new(
            &self.orchestrator,
            self.analyzer.clone(),
            self.documents.clone(),
            DocumentCache::new(16),
        );
        WorkerRuntime::new(
            self.queue.clone(),
            HandlerRegistry::with_defaults(),
            deps,
            settings(name),
        )
    }
}

pub async fn drain(runtime: &WorkerRuntime) -> Vec<Execution> {
    let mut executions = Vec::new();
    while let Some(execution) = runtime.poll_once().await.unwrap() {
        executions.push(execution);
    }
    executions
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

pub fn single_input(primary: usize) -> NewJob {
    NewJob {
        mode: AnalysisMode::JokboCentric,
        owner_user_id: None,
        input_refs: InputRefs {
            primary: (0..primary).map(|i| format!("jokbo/{i}.pdf")).collect(),
            counterpart: vec!["lesson/0.pdf".into()],
        },
        model_tier: ModelTier::Pro,
        multi_api: false,
        min_relevance: None,
        is_batch: false,
        estimated_units: None,
    }
}

pub fn count(executions: &[Execution], wanted: &Execution) -> usize {
    executions.iter().filter(|e| *e == wanted).count()
}
