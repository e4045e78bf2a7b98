//! Embedding layout, generation and caching
//!
//! - `EmbeddingSchema` fixes the vector length and its named segments
//! - `EmbeddingProvider` turns text into vectors (local FastEmbed by default)
//! - `EmbeddingCache` keeps one vector per document keyed by content fingerprint
//! - `Backfiller` fills in missing or stale document embeddings

mod backfill;
mod cache;
mod provider;
mod schema;

pub use backfill::{BackfillReport, Backfiller};
pub use cache::{fingerprint, CacheEntry, CacheStats, EmbeddingCache};
pub use provider::{EmbeddingError, EmbeddingProvider, FastEmbedProvider, RateLimitedProvider};
pub use schema::{default_segments, EmbeddingSchema, SchemaError, Segment};
