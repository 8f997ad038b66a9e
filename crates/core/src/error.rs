use crate::types::UserId;

/// Domain error taxonomy shared by every layer of the orchestrator.
///
/// Request-path operations propagate these with `?`. Background and
/// best-effort operations log them and continue.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// The requester is not the owner of the job.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// A backing-store operation failed. Transient; safe to retry.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The task queue could not accept work at submit time.
    #[error("Dispatch failed: {0}")]
    DispatchFailure(String),

    #[error("Quota exhausted for user {user_id} (balance {balance})")]
    QuotaExhausted { user_id: UserId, balance: i64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Shorthand for a `NotFound` error with a string-like id.
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether the caller may retry the same operation unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::StorageUnavailable(_) | CoreError::DispatchFailure(_)
        )
    }
}
