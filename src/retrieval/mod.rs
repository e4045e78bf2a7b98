//! Query paths over the voicing index
//!
//! `EnhancedSearchService` runs generic nearest-neighbour lookups through the
//! current strategy with a single in-memory fallback. `WeightedRetrievalService`
//! is the precision path: it reads raw vectors from the index and combines
//! per-segment cosine scores with a named preset. `VoicingContextRetriever`
//! sits in front of both for text queries.

mod context;
mod enhanced;
mod presets;
mod weighted;

pub use context::{ContextMatch, VoicingContextRetriever};
pub use enhanced::EnhancedSearchService;
pub use presets::{builtin_presets, PresetRegistry, SearchPreset};
pub use weighted::{SegmentScore, WeightedRetrievalService};
