/// Backfill pass: compute missing or stale document embeddings through the cache
use super::{EmbeddingCache, EmbeddingError, EmbeddingProvider};
use crate::error::Result;
use crate::index::{VectorIndex, VoicingDocument};
use crate::storage::SqliteVectorStore;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Result of a backfill pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    /// Documents that now carry a current embedding
    pub processed: usize,
    /// Of those, served from the cache without calling the provider
    pub reused: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

enum Outcome {
    Computed(String, Vec<f32>),
    Reused(String, Vec<f32>),
    Failed(String, EmbeddingError),
}

type Pending = (Arc<VoicingDocument>, String);

pub struct Backfiller {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<EmbeddingCache>,
    batch_size: usize,
    max_concurrent: usize,
}

impl Backfiller {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<EmbeddingCache>,
        batch_size: usize,
        max_concurrent: usize,
    ) -> Self {
        Self {
            provider,
            cache,
            batch_size: batch_size.max(1),
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Embed every document in `index` whose embedding is missing or whose
    /// content changed since it was computed, then mirror the index into `store`
    ///
    /// Embeddings shipped with documents are trusted and seeded into the cache
    /// on first sight. Remaining documents go to the provider in chunks of
    /// `batch_size`, at most `max_concurrent` chunks at a time.
    pub async fn backfill(
        &self,
        index: &VectorIndex,
        store: Option<Arc<SqliteVectorStore>>,
    ) -> Result<BackfillReport> {
        let start = std::time::Instant::now();
        let snapshot = index.snapshot();
        info!("Starting embedding backfill of {} documents", snapshot.len());

        let mut report = BackfillReport::default();
        let mut pending: Vec<Pending> = Vec::new();

        for document in snapshot.iter().cloned() {
            let fingerprint = document.content_fingerprint();
            if let Some(existing) = &document.embedding {
                if self.cache.get(&document.id).is_none() {
                    self.cache
                        .insert(&document.id, &fingerprint, existing.clone());
                }
            }

            match self.cache.fresh(&document.id, &fingerprint) {
                Some(vector) => {
                    publish(index, &document.id, vector)?;
                    report.processed += 1;
                    report.reused += 1;
                }
                None => pending.push((document, fingerprint)),
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();

        for chunk in pending.chunks(self.batch_size) {
            let chunk = chunk.to_vec();
            let cache = self.cache.clone();
            let provider = self.provider.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        return chunk
                            .iter()
                            .map(|(document, _)| {
                                Outcome::Failed(
                                    document.id.clone(),
                                    EmbeddingError::GenerationError(e.to_string()),
                                )
                            })
                            .collect::<Vec<_>>();
                    }
                };
                embed_chunk(&cache, provider.as_ref(), &chunk).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let outcomes = match joined {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    warn!("Backfill task failed: {}", e);
                    continue;
                }
            };

            for outcome in outcomes {
                match outcome {
                    Outcome::Computed(id, vector) => {
                        publish(index, &id, vector)?;
                        report.processed += 1;
                    }
                    Outcome::Reused(id, vector) => {
                        publish(index, &id, vector)?;
                        report.processed += 1;
                        report.reused += 1;
                    }
                    Outcome::Failed(id, e) => {
                        warn!("Failed to embed document {}: {}", id, e);
                        report.failed += 1;
                    }
                }
            }
        }

        if let Some(store) = store {
            let documents: Vec<VoicingDocument> =
                index.snapshot().iter().map(|d| d.as_ref().clone()).collect();
            let mirrored = tokio::task::spawn_blocking(move || store.upsert_many(&documents))
                .await
                .map_err(|e| anyhow::anyhow!("store mirror task failed: {}", e))??;
            debug!("Mirrored {} documents to the persistent store", mirrored);
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Backfill complete: {} processed ({} reused), {} failed, {}ms",
            report.processed, report.reused, report.failed, report.duration_ms
        );
        Ok(report)
    }
}

/// Embed one chunk with a single batch call
///
/// When the batch call fails or returns the wrong count, each document is
/// retried alone so one bad input fails only itself.
async fn embed_chunk(
    cache: &EmbeddingCache,
    provider: &dyn EmbeddingProvider,
    chunk: &[Pending],
) -> Vec<Outcome> {
    let texts: Vec<String> = chunk.iter().map(|(d, _)| d.embedding_text()).collect();

    let vectors: Vec<std::result::Result<Vec<f32>, EmbeddingError>> =
        match provider.generate_batch_embeddings(&texts).await {
            Ok(vectors) if vectors.len() == chunk.len() => vectors.into_iter().map(Ok).collect(),
            outcome => {
                match outcome {
                    Ok(vectors) => warn!(
                        "Embedding count mismatch: expected {}, got {}; retrying one by one",
                        chunk.len(),
                        vectors.len()
                    ),
                    Err(e) => debug!("Batch of {} failed ({}); retrying one by one", chunk.len(), e),
                }
                let mut single = Vec::with_capacity(texts.len());
                for text in &texts {
                    single.push(provider.generate_embedding(text).await);
                }
                single
            }
        };

    let mut outcomes = Vec::with_capacity(chunk.len());
    for ((document, fingerprint), vector) in chunk.iter().zip(vectors) {
        let outcome = match vector {
            Ok(vector) => record(cache, document, fingerprint, vector).await,
            Err(e) => Outcome::Failed(document.id.clone(), e),
        };
        outcomes.push(outcome);
    }
    outcomes
}

/// Route a freshly computed vector through the cache so a concurrent
/// computation for the same key and content is shared rather than duplicated
async fn record(
    cache: &EmbeddingCache,
    document: &VoicingDocument,
    fingerprint: &str,
    vector: Vec<f32>,
) -> Outcome {
    let computed = AtomicBool::new(false);
    let result = cache
        .get_or_compute(&document.id, fingerprint, || async {
            computed.store(true, Ordering::Relaxed);
            Ok::<_, EmbeddingError>(vector)
        })
        .await;

    match result {
        Ok(vector) if computed.load(Ordering::Relaxed) => {
            Outcome::Computed(document.id.clone(), vector)
        }
        Ok(vector) => Outcome::Reused(document.id.clone(), vector),
        Err(e) => Outcome::Failed(document.id.clone(), e),
    }
}

/// Write the vector back unless the index already holds exactly it
fn publish(index: &VectorIndex, id: &str, vector: Vec<f32>) -> Result<()> {
    let unchanged = index
        .get(id)
        .map(|d| d.embedding.as_deref() == Some(vector.as_slice()))
        .unwrap_or(false);
    if !unchanged {
        index.set_embedding(id, vector)?;
    }
    Ok(())
}
