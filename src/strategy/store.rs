//! Persistent-store strategy: similarity computed by the backing store itself
//!
//! Unlike the CPU and GPU strategies, reachability of a remote store can
//! change at runtime, so it is re-checked before every search.

use super::{
    rank, Capability, ProbeError, SearchError, SearchResult, SearchStrategy, PERSISTENT_STORE,
};
use crate::embedding::EmbeddingSchema;
use crate::index::VoicingDocument;
use crate::storage::StoreError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A document returned by the store with its store-computed score
#[derive(Debug, Clone)]
pub struct StoreHit {
    pub document: VoicingDocument,
    pub score: f32,
}

/// Backing store with a native vector-similarity query
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Human-readable location (path or URL)
    fn describe(&self) -> String;

    /// Cheap round trip proving the store is reachable
    async fn ping(&self) -> Result<(), StoreError>;

    /// Up to `top_k` embedded documents by cosine similarity, best first
    async fn nearest(&self, query: &[f32], top_k: usize) -> Result<Vec<StoreHit>, StoreError>;
}

pub struct PersistentStoreStrategy {
    store: Arc<dyn VectorStore>,
    schema: Arc<EmbeddingSchema>,
    reachable: AtomicBool,
}

impl PersistentStoreStrategy {
    pub fn new(store: Arc<dyn VectorStore>, schema: Arc<EmbeddingSchema>) -> Self {
        Self {
            store,
            schema,
            reachable: AtomicBool::new(false),
        }
    }

    async fn check_reachable(&self) -> Result<(), SearchError> {
        match self.store.ping().await {
            Ok(()) => {
                self.reachable.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                if self.reachable.swap(false, Ordering::AcqRel) {
                    warn!("Persistent store became unreachable: {}", e);
                }
                Err(SearchError::transient(PERSISTENT_STORE, e.to_string()))
            }
        }
    }
}

#[async_trait]
impl SearchStrategy for PersistentStoreStrategy {
    fn name(&self) -> &str {
        PERSISTENT_STORE
    }

    fn performance_characteristics(&self) -> &str {
        "Similarity delegated to the backing store's native vector query; durable, higher tail latency from I/O"
    }

    async fn probe(&self) -> Result<Capability, ProbeError> {
        match self.store.ping().await {
            Ok(()) => {
                self.reachable.store(true, Ordering::Release);
                Ok(Capability::new("store", self.store.describe()))
            }
            Err(e) => {
                self.reachable.store(false, Ordering::Release);
                Err(ProbeError::Unreachable(e.to_string()))
            }
        }
    }

    fn is_available(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, SearchError> {
        self.schema.validate_vector(query)?;
        if cancel.is_cancelled() {
            return Err(SearchError::Cancelled);
        }
        self.check_reachable().await?;

        let hits = tokio::select! {
            _ = cancel.cancelled() => return Err(SearchError::Cancelled),
            hits = self.store.nearest(query, top_k) => hits
                .map_err(|e| SearchError::transient(PERSISTENT_STORE, e.to_string()))?,
        };

        let results = hits
            .into_iter()
            .map(|hit| SearchResult::new(Arc::new(hit.document), hit.score))
            .collect();
        Ok(rank(results, top_k))
    }
}
