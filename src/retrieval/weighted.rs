//! Weighted multi-segment ranking
//!
//! Each scored segment of the schema is compared independently (cosine over
//! the segment's slice of query and document) and the per-segment scores are
//! combined as a plain weighted sum: `score = Σ weight(segment) · cos(segment)`.
//! Weights need not sum to one and unused segments never contribute.

use super::PresetRegistry;
use crate::index::{Snapshot, VectorIndex, VoicingDocument};
use crate::strategy::{
    cosine_from_parts, dot, norm, rank, SearchError, SearchResult, CANCEL_CHECK_INTERVAL,
};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Cosine of one segment, for explanation output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentScore {
    pub segment: String,
    pub cosine: f32,
}

/// Segment slice with its weight and the query's norm over that slice
#[derive(Debug, Clone, Copy)]
struct WeightedSlice {
    offset: usize,
    length: usize,
    weight: f32,
    query_norm: f32,
}

pub struct WeightedRetrievalService {
    index: Arc<VectorIndex>,
    presets: Arc<PresetRegistry>,
}

impl WeightedRetrievalService {
    pub fn new(index: Arc<VectorIndex>, presets: Arc<PresetRegistry>) -> Self {
        Self { index, presets }
    }

    /// Registered preset names
    pub fn presets(&self) -> Vec<String> {
        self.presets.names()
    }

    pub async fn search(
        &self,
        query: &[f32],
        preset_name: &str,
        top_k: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let preset = self.presets.get(preset_name)?;
        let schema = self.index.schema();
        schema.validate_vector(query)?;
        if cancel.is_cancelled() {
            return Err(SearchError::Cancelled);
        }

        let slices: Vec<WeightedSlice> = schema
            .scored_segments()
            .filter_map(|segment| {
                let weight = preset.weights.get(&segment.name).copied().unwrap_or(0.0);
                (weight != 0.0).then(|| WeightedSlice {
                    offset: segment.offset,
                    length: segment.length,
                    weight,
                    query_norm: norm(segment.slice(query)),
                })
            })
            .collect();

        let snapshot = self.index.snapshot();
        let query = query.to_vec();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || weighted_scan(&snapshot, &query, &slices, top_k, &cancel))
            .await
            .map_err(|e| SearchError::transient("Weighted", format!("scan task failed: {}", e)))?
    }

    /// Per-segment cosine between `query` and `document`, in layout order
    pub fn segment_scores(
        &self,
        query: &[f32],
        document: &VoicingDocument,
    ) -> Result<Vec<SegmentScore>, SearchError> {
        let schema = self.index.schema();
        schema.validate_vector(query)?;
        let embedding = document
            .embedding
            .as_deref()
            .ok_or_else(|| SearchError::NotFound(format!("embedding for {}", document.id)))?;

        Ok(schema
            .scored_segments()
            .map(|segment| {
                let q = segment.slice(query);
                let d = segment.slice(embedding);
                SegmentScore {
                    segment: segment.name.clone(),
                    cosine: cosine_from_parts(dot(q, d), norm(q), norm(d)),
                }
            })
            .collect())
    }
}

fn weighted_scan(
    snapshot: &Snapshot,
    query: &[f32],
    slices: &[WeightedSlice],
    top_k: usize,
    cancel: &CancellationToken,
) -> Result<Vec<SearchResult>, SearchError> {
    let mut scored = Vec::with_capacity(snapshot.len());

    for (position, document) in snapshot.iter().enumerate() {
        if position % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(SearchError::Cancelled);
        }
        let Some(embedding) = document.embedding.as_deref() else {
            continue;
        };

        let score: f32 = slices
            .iter()
            .map(|s| {
                let q = &query[s.offset..s.offset + s.length];
                let d = &embedding[s.offset..s.offset + s.length];
                s.weight * cosine_from_parts(dot(q, d), s.query_norm, norm(d))
            })
            .sum();
        scored.push(SearchResult::new(document.clone(), score));
    }

    if cancel.is_cancelled() {
        return Err(SearchError::Cancelled);
    }
    Ok(rank(scored, top_k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingSchema, Segment};
    use crate::retrieval::SearchPreset;
    use crate::strategy::cosine_similarity;

    /// 6 dims: pad 0..1 (unused), tone 1..4, shape 4..6
    fn schema() -> Arc<EmbeddingSchema> {
        Arc::new(
            EmbeddingSchema::new(
                6,
                vec![
                    Segment::unused("pad", 0, 1),
                    Segment::new("tone", 1, 3),
                    Segment::new("shape", 4, 2),
                ],
            )
            .unwrap(),
        )
    }

    fn service() -> WeightedRetrievalService {
        let schema = schema();
        let index = Arc::new(VectorIndex::new(schema.clone()));
        index
            .add_range(vec![
                VoicingDocument::new("a", "Cmaj7", 0)
                    .with_embedding(vec![9.0, 1.0, 0.0, 0.0, 0.0, 1.0]),
                VoicingDocument::new("b", "Am7", 9)
                    .with_embedding(vec![0.0, 0.9, 0.1, 0.0, 1.0, 0.0]),
                VoicingDocument::new("c", "G7", 7)
                    .with_embedding(vec![0.0, 0.0, 0.0, 1.0, 0.7, 0.7]),
                VoicingDocument::new("d", "Fmaj7", 5),
            ])
            .unwrap();

        let presets = PresetRegistry::new(
            &schema,
            vec![
                SearchPreset::new("tone-only", [("tone", 1.0)]),
                SearchPreset::new("shape-only", [("shape", 1.0), ("tone", 0.0)]),
                SearchPreset::new("mixed", [("tone", 2.0), ("shape", 0.5)]),
                SearchPreset::new("tone-not-shape", [("tone", 1.0), ("shape", -1.0)]),
            ],
        )
        .unwrap();
        WeightedRetrievalService::new(index, Arc::new(presets))
    }

    #[tokio::test]
    async fn test_unknown_preset() {
        let err = service()
            .search(&[0.0; 6], "rhythmic", 3, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, SearchError::InvalidPreset("rhythmic".to_string()));
    }

    #[tokio::test]
    async fn test_degenerate_preset_matches_single_segment_ranking() {
        let service = service();
        let query = [0.0, 0.5, 0.5, 0.2, 0.3, 0.9];

        let weighted = service
            .search(&query, "shape-only", 10, &CancellationToken::new())
            .await
            .unwrap();

        let mut expected: Vec<(String, f32)> = service
            .index
            .snapshot()
            .iter()
            .filter_map(|d| {
                d.embedding
                    .as_ref()
                    .map(|e| (d.id.clone(), cosine_similarity(&query[4..6], &e[4..6])))
            })
            .collect();
        expected.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        assert_eq!(weighted.len(), expected.len());
        for (result, (id, score)) in weighted.iter().zip(&expected) {
            assert_eq!(result.id(), id);
            assert!((result.score - score).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn test_weights_combine_linearly() {
        let service = service();
        let query = [0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        let results = service
            .search(&query, "mixed", 1, &CancellationToken::new())
            .await
            .unwrap();

        // Doc "a" matches both segments exactly: 2.0 * 1 + 0.5 * 1
        assert_eq!(results[0].id(), "a");
        assert!((results[0].score - 2.5).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_negative_weight_penalizes_segment() {
        let service = service();
        let query = [0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        let results = service
            .search(&query, "tone-not-shape", 3, &CancellationToken::new())
            .await
            .unwrap();

        // "a" matches tone and shape exactly, so the shape penalty cancels it out
        let ids: Vec<&str> = results.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert!(results[1].score.abs() < 1e-6);
        assert!(results[2].score < 0.0);
    }

    #[tokio::test]
    async fn test_unused_segment_never_scores() {
        let service = service();
        // Only the padding dimension is set; every scored slice of the query is zero
        let results = service
            .search(&[1.0, 0.0, 0.0, 0.0, 0.0, 0.0], "mixed", 3, &CancellationToken::new())
            .await
            .unwrap();
        assert!(results.iter().all(|r| r.score == 0.0));
        let ids: Vec<&str> = results.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_segment_scores_breakdown() {
        let service = service();
        let doc = service.index.get("c").unwrap();
        let scores = service
            .segment_scores(&[0.0, 0.0, 0.0, 1.0, 0.7, 0.7], &doc)
            .unwrap();
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0].segment, "tone");
        assert!((scores[0].cosine - 1.0).abs() < 1e-6);
        assert!((scores[1].cosine - 1.0).abs() < 1e-6);

        let missing = service.index.get("d").unwrap();
        assert!(service.segment_scores(&[0.0; 6], &missing).is_err());
    }
}
