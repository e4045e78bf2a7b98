//! Resilient search facade over the strategy manager

use crate::strategy::{SearchError, SearchResult, StrategyManager, IN_MEMORY};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct EnhancedSearchService {
    manager: Arc<StrategyManager>,
}

impl EnhancedSearchService {
    pub fn new(manager: Arc<StrategyManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<StrategyManager> {
        &self.manager
    }

    /// Search with the current strategy, retrying once on the in-memory scan
    /// after a device or network fault
    ///
    /// When the retry also fails the original error is returned. Caller
    /// outcomes (cancellation, bad query length) are returned as-is.
    pub async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let strategy = self.manager.current_handle();
        let name = strategy.name().to_string();

        let start = Instant::now();
        let error = match strategy.search(query, top_k, cancel).await {
            Ok(results) => {
                self.manager.record_success(&name, start.elapsed());
                return Ok(results);
            }
            Err(SearchError::Cancelled) => {
                debug!("Search on {} cancelled", name);
                return Err(SearchError::Cancelled);
            }
            Err(e) => e,
        };

        self.manager.record_failure(&name);
        if !error.is_recoverable() || name == IN_MEMORY {
            return Err(error);
        }

        warn!("Search on {} failed, retrying on {}: {}", name, IN_MEMORY, error);
        self.manager.record_fallback(&name);

        let fallback = self.manager.fallback();
        let start = Instant::now();
        match fallback.search(query, top_k, cancel).await {
            Ok(results) => {
                self.manager.record_success(IN_MEMORY, start.elapsed());
                Ok(results)
            }
            Err(SearchError::Cancelled) => {
                debug!("Fallback search cancelled");
                Err(SearchError::Cancelled)
            }
            Err(fallback_error) => {
                warn!("Fallback search on {} also failed: {}", IN_MEMORY, fallback_error);
                self.manager.record_failure(IN_MEMORY);
                Err(error)
            }
        }
    }
}
