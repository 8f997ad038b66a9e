//! Input documents: the remote file store and the worker's shared cache.

use std::sync::Arc;

use async_trait::async_trait;
use jokbo_core::error::CoreError;
use jokbo_orchestrator::file_refs::FileRefStore;
use moka::future::Cache;

/// A fetched input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub key: String,
    pub bytes: Arc<[u8]>,
}

impl Document {
    pub fn new(key: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            key: key.into(),
            bytes: bytes.into(),
        }
    }
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// `NotFound` once the file has expired from the store.
    async fn fetch(&self, key: &str) -> Result<Document, CoreError>;
}

// ---------------------------------------------------------------------------
// HTTP file store
// ---------------------------------------------------------------------------

/// Client for the external file store. Serves documents to the worker and
/// TTL refreshes to the orchestrator.
pub struct HttpDocumentSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDocumentSource {
    /// * `base_url` - e.g. `http://files:9000`.
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

fn unavailable(err: reqwest::Error) -> CoreError {
    CoreError::StorageUnavailable(format!("File store request failed: {err}"))
}

#[async_trait]
impl DocumentSource for HttpDocumentSource {
    async fn fetch(&self, key: &str) -> Result<Document, CoreError> {
        let response = self
            .client
            .get(format!("{}/files/{}", self.base_url, key))
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(CoreError::not_found("File", key));
        }
        if !status.is_success() {
            return Err(CoreError::StorageUnavailable(format!(
                "File store returned {status} for {key}"
            )));
        }
        let bytes = response.bytes().await.map_err(unavailable)?;
        Ok(Document::new(key, bytes.to_vec()))
    }
}

#[async_trait]
impl FileRefStore for HttpDocumentSource {
    async fn refresh_ttls(&self, keys: &[String]) -> Result<(), CoreError> {
        let response = self
            .client
            .post(format!("{}/files/ttl", self.base_url))
            .json(&serde_json::json!({ "keys": keys }))
            .send()
            .await
            .map_err(unavailable)?;
        if !response.status().is_success() {
            return Err(CoreError::StorageUnavailable(format!(
                "TTL refresh returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Bounded cache of fetched documents shared by every unit on a worker.
///
/// Sibling units of a batch share their counterpart files, so each file is
/// fetched once per worker instead of once per unit. Concurrent misses on
/// the same key wait on a single fetch.
#[derive(Clone)]
pub struct DocumentCache {
    entries: Cache<String, Arc<Document>>,
}

impl DocumentCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Cache::builder().max_capacity(capacity as u64).build(),
        }
    }

    /// The cached document for `key`, fetching it from `source` on a miss.
    /// Failed fetches are not cached.
    pub async fn get_or_fetch(
        &self,
        key: &str,
        source: &dyn DocumentSource,
    ) -> Result<Arc<Document>, CoreError> {
        self.entries
            .try_get_with_by_ref(key, async { source.fetch(key).await.map(Arc::new) })
            .await
            .map_err(|e| CoreError::clone(&e))
    }

    /// Entry count after pending evictions have been applied.
    pub async fn len(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every entry. Called on shutdown.
    pub async fn clear(&self) {
        let dropped = self.len().await;
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
        tracing::debug!(dropped, "Document cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;

    use super::*;

    #[derive(Default)]
    struct CountingSource {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl DocumentSource for CountingSource {
        async fn fetch(&self, key: &str) -> Result<Document, CoreError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if key == "missing" {
                return Err(CoreError::not_found("File", key));
            }
            Ok(Document::new(key, key.as_bytes().to_vec()))
        }
    }

    #[derive(Default)]
    struct SlowSource {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl DocumentSource for SlowSource {
        async fn fetch(&self, key: &str) -> Result<Document, CoreError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            Ok(Document::new(key, key.as_bytes().to_vec()))
        }
    }

    #[tokio::test]
    async fn hits_do_not_refetch() {
        let source = CountingSource::default();
        let cache = DocumentCache::new(4);
        let a = cache.get_or_fetch("a.pdf", &source).await.unwrap();
        let again = cache.get_or_fetch("a.pdf", &source).await.unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn capacity_bounds_the_entry_count() {
        let source = CountingSource::default();
        let cache = DocumentCache::new(2);
        for key in ["a", "b", "c", "d"] {
            cache.get_or_fetch(key, &source).await.unwrap();
        }
        assert!(cache.len().await <= 2);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let source = SlowSource::default();
        let cache = DocumentCache::new(4);
        let (a, b, c) = tokio::join!(
            cache.get_or_fetch("lesson.pdf", &source),
            cache.get_or_fetch("lesson.pdf", &source),
            cache.get_or_fetch("lesson.pdf", &source),
        );
        let a = a.unwrap();
        assert!(Arc::ptr_eq(&a, &b.unwrap()));
        assert!(Arc::ptr_eq(&a, &c.unwrap()));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let source = CountingSource::default();
        let cache = DocumentCache::new(2);
        assert_matches!(
            cache.get_or_fetch("missing", &source).await,
            Err(CoreError::NotFound { .. })
        );
        assert!(cache.is_empty().await);
        // The next lookup fetches again.
        let _ = cache.get_or_fetch("missing", &source).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clear_empties_the_cache() {
        let source = CountingSource::default();
        let cache = DocumentCache::new(2);
        cache.get_or_fetch("a", &source).await.unwrap();
        cache.clear().await;
        assert!(cache.is_empty().await);
    }
}
