//! In-memory voicing collection
//!
//! Documents are held in an immutable snapshot that is replaced on every
//! mutation. Readers clone the snapshot `Arc` and never observe a document
//! mid-update; an embedding becomes visible only once it has been written in
//! full.

mod document;

pub use document::{load_documents, VoicingDocument};

use crate::embedding::EmbeddingSchema;
use crate::strategy::SearchError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Shared read-only view of the index contents
pub type Snapshot = Arc<Vec<Arc<VoicingDocument>>>;

pub struct VectorIndex {
    schema: Arc<EmbeddingSchema>,
    documents: RwLock<Snapshot>,
    generation: AtomicU64,
}

impl VectorIndex {
    pub fn new(schema: Arc<EmbeddingSchema>) -> Self {
        Self {
            schema,
            documents: RwLock::new(Arc::new(Vec::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn schema(&self) -> &Arc<EmbeddingSchema> {
        &self.schema
    }

    /// Append a document, replacing any existing document with the same id
    ///
    /// Documents without an embedding are accepted and skipped by searches
    /// until backfilled.
    pub fn add(&self, document: VoicingDocument) -> Result<(), SearchError> {
        self.add_range(std::iter::once(document))
    }

    /// Append many documents in one snapshot swap; rejects the whole batch on a bad vector
    pub fn add_range<I>(&self, documents: I) -> Result<(), SearchError>
    where
        I: IntoIterator<Item = VoicingDocument>,
    {
        let documents: Vec<VoicingDocument> = documents.into_iter().collect();
        for document in &documents {
            if let Some(embedding) = &document.embedding {
                self.schema.validate_vector(embedding)?;
            }
        }

        self.mutate(|docs| {
            for document in documents {
                upsert(docs, Arc::new(document));
            }
        });
        Ok(())
    }

    /// Publish a completed embedding for `id`; returns false if the id is unknown
    pub fn set_embedding(&self, id: &str, embedding: Vec<f32>) -> Result<bool, SearchError> {
        self.schema.validate_vector(&embedding)?;

        let mut found = false;
        self.mutate(|docs| {
            if let Some(slot) = docs.iter_mut().find(|d| d.id == id) {
                let mut updated = slot.as_ref().clone();
                updated.embedding = Some(embedding);
                *slot = Arc::new(updated);
                found = true;
            }
        });
        Ok(found)
    }

    /// Remove a document by id
    pub fn remove(&self, id: &str) -> Option<Arc<VoicingDocument>> {
        let mut removed = None;
        self.mutate(|docs| {
            if let Some(position) = docs.iter().position(|d| d.id == id) {
                removed = Some(docs.remove(position));
            }
        });
        removed
    }

    /// First document whose chord name contains `fragment`, case-insensitively,
    /// in insertion order
    pub fn find_by_identity(&self, fragment: &str) -> Option<Arc<VoicingDocument>> {
        let needle = fragment.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        self.snapshot()
            .iter()
            .find(|d| d.chord_name.to_lowercase().contains(&needle))
            .cloned()
    }

    pub fn get(&self, id: &str) -> Option<Arc<VoicingDocument>> {
        self.snapshot().iter().find(|d| d.id == id).cloned()
    }

    /// Current documents; cheap to take and stable for the caller's lifetime
    pub fn snapshot(&self) -> Snapshot {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Incremented on every mutation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn embedded_count(&self) -> usize {
        self.snapshot().iter().filter(|d| d.has_embedding()).count()
    }

    fn mutate<F>(&self, apply: F)
    where
        F: FnOnce(&mut Vec<Arc<VoicingDocument>>),
    {
        let mut guard = self
            .documents
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.as_ref().clone();
        apply(&mut next);
        *guard = Arc::new(next);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

fn upsert(docs: &mut Vec<Arc<VoicingDocument>>, document: Arc<VoicingDocument>) {
    match docs.iter_mut().find(|d| d.id == document.id) {
        Some(slot) => *slot = document,
        None => docs.push(document),
    }
}
