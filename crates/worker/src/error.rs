use jokbo_core::error::CoreError;
use jokbo_orchestrator::cancellation::Cancelled;

use crate::analyzer::AnalyzerError;

/// How a handler execution ended when it did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Transient failure; the runtime requeues while retries are left.
    #[error("Retryable failure: {0}")]
    Retry(String),

    #[error("{0}")]
    Failed(String),

    /// The unit stopped at a checkpoint.
    #[error("Cancelled")]
    Cancelled,
}

impl From<Cancelled> for TaskError {
    fn from(_: Cancelled) -> Self {
        TaskError::Cancelled
    }
}

impl From<CoreError> for TaskError {
    fn from(err: CoreError) -> Self {
        if err.is_transient() {
            TaskError::Retry(err.to_string())
        } else {
            TaskError::Failed(err.to_string())
        }
    }
}

impl From<AnalyzerError> for TaskError {
    fn from(err: AnalyzerError) -> Self {
        match err {
            AnalyzerError::Transient(_) => TaskError::Retry(err.to_string()),
            AnalyzerError::Cancelled => TaskError::Cancelled,
            AnalyzerError::Rejected(_) => TaskError::Failed(err.to_string()),
        }
    }
}
