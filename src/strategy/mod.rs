//! Interchangeable similarity-search execution strategies
//!
//! Every strategy computes the same quantity (cosine similarity between the
//! query and each embedded document) and returns results in the same order:
//! score descending, ties broken by document id ascending. They differ only in
//! where the computation runs:
//! - `InMemoryStrategy`: vectorized scan over the index snapshot, always available
//! - `GpuStrategy`: batched kernel over a device-resident copy of the vectors
//! - `PersistentStoreStrategy`: delegated to the store's native vector query

mod gpu;
mod in_memory;
mod manager;
mod store;

pub use gpu::{DeviceProbe, GpuStrategy};
pub use in_memory::InMemoryStrategy;
pub use manager::{
    AutoSelection, BenchmarkEntry, BenchmarkReport, StrategyDescriptor, StrategyManager,
    StrategyStats, GPU, IN_MEMORY, PERSISTENT_STORE,
};
pub use store::{PersistentStoreStrategy, StoreHit, VectorStore};

use crate::index::VoicingDocument;
use async_trait::async_trait;
use ndarray::ArrayView1;
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Documents scanned between cancellation checks
pub(crate) const CANCEL_CHECK_INTERVAL: usize = 256;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchError {
    /// Unknown strategy or document
    #[error("Not found: {0}")]
    NotFound(String),

    /// Registered but the hardware/runtime probe failed
    #[error("Strategy unavailable: {0}")]
    Unavailable(String),

    /// Recoverable device or network fault during a search
    #[error("Transient failure in {strategy}: {message}")]
    TransientFailure { strategy: String, message: String },

    #[error("Unknown search preset: {0}")]
    InvalidPreset(String),

    #[error("Invalid vector length: expected {expected}, got {actual}")]
    InvalidVectorLength { expected: usize, actual: usize },

    #[error("A benchmark run is already in progress")]
    Busy,

    #[error("Search cancelled")]
    Cancelled,
}

impl SearchError {
    pub fn transient(strategy: &str, message: impl Into<String>) -> Self {
        Self::TransientFailure {
            strategy: strategy.to_string(),
            message: message.into(),
        }
    }

    /// Faults a resilience layer may retry on another strategy
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::TransientFailure { .. } | Self::Unavailable(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("No compatible device found: {0}")]
    DeviceNotFound(String),

    #[error("Device runtime error: {0}")]
    Driver(String),

    #[error("Backing store unreachable: {0}")]
    Unreachable(String),

    #[error("Probe panicked: {0}")]
    Panicked(String),
}

/// What a successful probe found
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Capability {
    pub backend: String,
    pub detail: String,
}

impl Capability {
    pub fn new(backend: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            detail: detail.into(),
        }
    }
}

/// A scored document
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub document: Arc<VoicingDocument>,
    pub score: f32,
}

impl SearchResult {
    pub fn new(document: Arc<VoicingDocument>, score: f32) -> Self {
        Self { document, score }
    }

    pub fn id(&self) -> &str {
        &self.document.id
    }
}

#[async_trait]
pub trait SearchStrategy: Send + Sync {
    /// Registry key, e.g. "InMemory"
    fn name(&self) -> &str;

    /// Static description reported to tooling; not measured
    fn performance_characteristics(&self) -> &str;

    /// Initialize the underlying hardware/runtime; implementations run the
    /// expensive part once and cache the outcome
    async fn probe(&self) -> Result<Capability, ProbeError>;

    /// Outcome of the last probe (or reachability check for remote stores)
    fn is_available(&self) -> bool;

    /// Top-`top_k` documents by cosine similarity to `query`
    ///
    /// Documents without an embedding are never scored. A cancelled search
    /// returns `SearchError::Cancelled` and no partial results.
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, SearchError>;
}

/// Sort by score descending then id ascending, and keep the first `top_k`
pub fn rank(mut results: Vec<SearchResult>, top_k: usize) -> Vec<SearchResult> {
    results.retain(|r| r.score.is_finite());
    results.sort_by(compare_results);
    results.truncate(top_k);
    results
}

pub(crate) fn compare_results(a: &SearchResult, b: &SearchResult) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.document.id.cmp(&b.document.id))
}

/// Euclidean norm via a vectorized dot product
#[inline]
pub fn norm(v: &[f32]) -> f32 {
    let view = ArrayView1::from(v);
    view.dot(&view).sqrt()
}

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    ArrayView1::from(a).dot(&ArrayView1::from(b))
}

/// Cosine from a precomputed dot product and norms; zero-norm vectors score 0
#[inline]
pub fn cosine_from_parts(dot: f32, norm_a: f32, norm_b: f32) -> f32 {
    let denom = norm_a * norm_b;
    if denom <= f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}

/// dot(a, b) / (|a| * |b|)
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    cosine_from_parts(dot(a, b), norm(a), norm(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, score: f32) -> SearchResult {
        SearchResult::new(Arc::new(VoicingDocument::new(id, id, 0)), score)
    }

    #[test]
    fn test_rank_orders_and_breaks_ties_by_id() {
        let ranked = rank(
            vec![
                result("b", 0.5),
                result("c", 0.9),
                result("a", 0.5),
                result("nan", f32::NAN),
            ],
            10,
        );
        let ids: Vec<&str> = ranked.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_rank_truncates() {
        let ranked = rank(vec![result("a", 0.1), result("b", 0.2)], 1);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id(), "b");
        assert!(rank(vec![result("a", 0.1)], 0).is_empty());
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 1.0], &[-1.0, -1.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_recoverable_kinds() {
        assert!(SearchError::transient("GPU", "device lost").is_recoverable());
        assert!(SearchError::Unavailable("x".into()).is_recoverable());
        assert!(!SearchError::Cancelled.is_recoverable());
        assert!(!SearchError::InvalidVectorLength {
            expected: 1,
            actual: 2
        }
        .is_recoverable());
    }
}
