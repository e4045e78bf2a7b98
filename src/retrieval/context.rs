//! Text query entry point used by the chat orchestrator

use super::{EnhancedSearchService, WeightedRetrievalService};
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::index::{VectorIndex, VoicingDocument};
use crate::strategy::SearchResult;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ContextMatch {
    /// The query named a chord held in the index
    Exact(Arc<VoicingDocument>),
    /// Similarity-ranked voicings for the embedded query
    Ranked(Vec<SearchResult>),
}

/// Resolves free text to voicings: identity lookup first, then similarity
pub struct VoicingContextRetriever {
    index: Arc<VectorIndex>,
    provider: Arc<dyn EmbeddingProvider>,
    search: Arc<EnhancedSearchService>,
    weighted: Arc<WeightedRetrievalService>,
}

impl VoicingContextRetriever {
    pub fn new(
        index: Arc<VectorIndex>,
        provider: Arc<dyn EmbeddingProvider>,
        search: Arc<EnhancedSearchService>,
        weighted: Arc<WeightedRetrievalService>,
    ) -> Self {
        Self {
            index,
            provider,
            search,
            weighted,
        }
    }

    /// With a preset the weighted path ranks; otherwise the current strategy does
    pub async fn retrieve(
        &self,
        text: &str,
        preset: Option<&str>,
        top_k: usize,
        cancel: &CancellationToken,
    ) -> Result<ContextMatch> {
        if let Some(document) = self.index.find_by_identity(text) {
            debug!("Identity match for {:?}: {}", text, document.id);
            return Ok(ContextMatch::Exact(document));
        }

        let query = self.provider.generate_embedding(text).await?;
        let results = match preset {
            Some(name) => self.weighted.search(&query, name, top_k, cancel).await?,
            None => self.search.search(&query, top_k, cancel).await?,
        };
        Ok(ContextMatch::Ranked(results))
    }
}
