//! Task handlers and the registry the runtime dispatches through.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use jokbo_core::task::TaskKind;
use jokbo_core::types::JobId;
use jokbo_orchestrator::cancellation::CancelProbe;
use jokbo_orchestrator::progress::ProgressTracker;
use jokbo_orchestrator::queue::ClaimedTask;
use jokbo_orchestrator::registry::JobRegistry;
use jokbo_orchestrator::store::JobStore;
use jokbo_orchestrator::Orchestrator;
use serde_json::Value;

use crate::analyzer::Analyzer;
use crate::documents::{Document, DocumentCache, DocumentSource};
use crate::error::TaskError;

pub mod aggregate;
pub mod batch_unit;
pub mod single;

pub use aggregate::AggregateBatchHandler;
pub use batch_unit::BatchUnitHandler;
pub use single::SingleAnalysisHandler;

/// Collaborators shared by every handler on a worker.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn JobStore>,
    pub registry: JobRegistry,
    pub progress: ProgressTracker,
    pub analyzer: Arc<dyn Analyzer>,
    pub documents: Arc<dyn DocumentSource>,
    pub cache: DocumentCache,
}

impl WorkerDeps {
    pub fn new(
        orchestrator: &Orchestrator,
        analyzer: Arc<dyn Analyzer>,
        documents: Arc<dyn DocumentSource>,
        cache: DocumentCache,
    ) -> Self {
        Self {
            store: Arc::clone(orchestrator.store()),
            registry: orchestrator.registry().clone(),
            progress: orchestrator.progress().clone(),
            analyzer,
            documents,
            cache,
        }
    }

    /// Fetch `key` through the shared cache.
    pub async fn document(&self, key: &str) -> Result<Arc<Document>, TaskError> {
        Ok(self.cache.get_or_fetch(key, self.documents.as_ref()).await?)
    }
}

/// Everything one execution of a unit can see.
pub struct TaskContext {
    pub task: ClaimedTask,
    pub job_id: JobId,
    pub probe: CancelProbe,
    pub deps: WorkerDeps,
}

impl TaskContext {
    /// Positional argument `index`.
    pub fn arg(&self, index: usize) -> Result<&Value, TaskError> {
        self.task
            .args
            .get(index)
            .ok_or_else(|| TaskError::Failed(format!("Missing argument {index}")))
    }

    pub fn str_arg(&self, index: usize) -> Result<&str, TaskError> {
        self.arg(index)?
            .as_str()
            .ok_or_else(|| TaskError::Failed(format!("Argument {index} must be a string")))
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run one execution. The returned value becomes the task result.
    async fn run(&self, ctx: &TaskContext) -> Result<Value, TaskError>;
}

/// Maps task kinds to their handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in handler.
    pub fn with_defaults() -> Self {
        let single: Arc<dyn TaskHandler> = Arc::new(SingleAnalysisHandler);
        let mut registry = Self::new();
        for kind in [
            TaskKind::RunJokboAnalysis,
            TaskKind::RunLessonAnalysis,
            TaskKind::GeneratePartialJokbo,
            TaskKind::RunExamOnly,
        ] {
            registry.register(kind, Arc::clone(&single));
        }
        registry.register(TaskKind::BatchAnalyzeSingle, Arc::new(BatchUnitHandler));
        registry.register(TaskKind::AggregateBatch, Arc::new(AggregateBatchHandler));
        registry
    }

    pub fn register(&mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }
}
