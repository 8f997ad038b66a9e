//! The external file store, as far as the orchestrator needs it.

use async_trait::async_trait;
use jokbo_core::error::CoreError;

/// Keeps uploaded inputs alive while their job exists.
#[async_trait]
pub trait FileRefStore: Send + Sync {
    /// Extend the expiry of every key. Callers treat failure as non-fatal.
    async fn refresh_ttls(&self, keys: &[String]) -> Result<(), CoreError>;
}

/// For deployments where inputs never expire.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFileRefs;

#[async_trait]
impl FileRefStore for NoopFileRefs {
    async fn refresh_ttls(&self, _keys: &[String]) -> Result<(), CoreError> {
        Ok(())
    }
}
