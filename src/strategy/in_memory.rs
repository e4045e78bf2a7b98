//! Reference strategy: exact cosine scan over the index snapshot

use super::{
    cosine_from_parts, dot, norm, rank, Capability, ProbeError, SearchError, SearchResult,
    SearchStrategy, CANCEL_CHECK_INTERVAL, IN_MEMORY,
};
use crate::index::{Snapshot, VectorIndex};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct InMemoryStrategy {
    index: Arc<VectorIndex>,
}

impl InMemoryStrategy {
    pub fn new(index: Arc<VectorIndex>) -> Self {
        Self { index }
    }
}

/// O(N·D) scan; checks `cancel` every `CANCEL_CHECK_INTERVAL` documents
pub(crate) fn scan(
    snapshot: &Snapshot,
    query: &[f32],
    top_k: usize,
    cancel: &CancellationToken,
) -> Result<Vec<SearchResult>, SearchError> {
    let query_norm = norm(query);
    let mut scored = Vec::with_capacity(snapshot.len());

    for (position, document) in snapshot.iter().enumerate() {
        if position % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(SearchError::Cancelled);
        }
        let Some(embedding) = document.embedding.as_deref() else {
            continue;
        };
        let score = cosine_from_parts(dot(query, embedding), query_norm, norm(embedding));
        scored.push(SearchResult::new(document.clone(), score));
    }

    if cancel.is_cancelled() {
        return Err(SearchError::Cancelled);
    }
    Ok(rank(scored, top_k))
}

#[async_trait]
impl SearchStrategy for InMemoryStrategy {
    fn name(&self) -> &str {
        IN_MEMORY
    }

    fn performance_characteristics(&self) -> &str {
        "Exact vectorized cosine scan on CPU; O(N*D) per query, deterministic, no hardware dependency"
    }

    async fn probe(&self) -> Result<Capability, ProbeError> {
        Ok(Capability::new("cpu", "vectorized scan"))
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, SearchError> {
        self.index.schema().validate_vector(query)?;
        if cancel.is_cancelled() {
            return Err(SearchError::Cancelled);
        }

        let snapshot = self.index.snapshot();
        let query = query.to_vec();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || scan(&snapshot, &query, top_k, &cancel))
            .await
            .map_err(|e| SearchError::transient(IN_MEMORY, format!("scan task failed: {}", e)))?
    }
}
