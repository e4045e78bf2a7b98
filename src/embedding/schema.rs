//! Fixed-length embedding layout split into named contiguous segments

use crate::strategy::SearchError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Unknown segment: {0}")]
    UnknownSegment(String),

    #[error("Segments {first} and {second} overlap")]
    SchemaOverlap { first: String, second: String },

    #[error("Dimensions {start}..{end} are not covered by any segment")]
    SchemaGap { start: usize, end: usize },

    #[error("Segment {name} ends at {end}, beyond total dimension {total}")]
    OutOfBounds {
        name: String,
        end: usize,
        total: usize,
    },

    #[error("Segment {0} has zero length")]
    EmptySegment(String),

    #[error("Segment {0} is declared more than once")]
    DuplicateSegment(String),

    #[error("Invalid weight for segment {segment}: {reason}")]
    InvalidWeight { segment: String, reason: String },
}

/// A named contiguous range of the embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub name: String,
    pub offset: usize,
    pub length: usize,
    /// Declared padding: covers its range but never contributes to scoring
    #[serde(default)]
    pub unused: bool,
}

impl Segment {
    pub fn new(name: impl Into<String>, offset: usize, length: usize) -> Self {
        Self {
            name: name.into(),
            offset,
            length,
            unused: false,
        }
    }

    pub fn unused(name: impl Into<String>, offset: usize, length: usize) -> Self {
        Self {
            unused: true,
            ..Self::new(name, offset, length)
        }
    }

    pub fn end(&self) -> usize {
        self.offset + self.length
    }

    /// Borrow this segment's slice of a full-length vector
    #[inline]
    pub fn slice<'a>(&self, vector: &'a [f32]) -> &'a [f32] {
        &vector[self.offset..self.end()]
    }
}

/// Immutable segment layout, built once at startup and shared behind an `Arc`
#[derive(Debug, Clone)]
pub struct EmbeddingSchema {
    total_dimension: usize,
    segments: Vec<Segment>,
    by_name: HashMap<String, usize>,
}

impl EmbeddingSchema {
    /// Build a schema, rejecting overlaps and uncovered ranges
    pub fn new(total_dimension: usize, segments: Vec<Segment>) -> Result<Self, SchemaError> {
        let mut by_name = HashMap::with_capacity(segments.len());
        for (position, segment) in segments.iter().enumerate() {
            if segment.length == 0 {
                return Err(SchemaError::EmptySegment(segment.name.clone()));
            }
            if by_name.insert(segment.name.clone(), position).is_some() {
                return Err(SchemaError::DuplicateSegment(segment.name.clone()));
            }
        }

        let mut ordered: Vec<&Segment> = segments.iter().collect();
        ordered.sort_by_key(|s| s.offset);

        let mut cursor = 0usize;
        let mut previous: Option<&Segment> = None;
        for segment in ordered {
            if segment.offset < cursor {
                let first = previous.map(|p| p.name.clone()).unwrap_or_default();
                return Err(SchemaError::SchemaOverlap {
                    first,
                    second: segment.name.clone(),
                });
            }
            if segment.offset > cursor {
                return Err(SchemaError::SchemaGap {
                    start: cursor,
                    end: segment.offset,
                });
            }
            if segment.end() > total_dimension {
                return Err(SchemaError::OutOfBounds {
                    name: segment.name.clone(),
                    end: segment.end(),
                    total: total_dimension,
                });
            }
            cursor = segment.end();
            previous = Some(segment);
        }

        if cursor < total_dimension {
            return Err(SchemaError::SchemaGap {
                start: cursor,
                end: total_dimension,
            });
        }

        Ok(Self {
            total_dimension,
            segments,
            by_name,
        })
    }

    /// Default 384-dimension voicing layout (matches all-MiniLM-L6-v2 output)
    ///
    /// - identity: reserved root one-hot block, excluded from scoring
    /// - structure: pitch-class set and interval content
    /// - morphology: fretboard shape, span and string usage
    /// - context: harmonic function and key relationships
    /// - symbolic: chord naming and tag semantics
    /// - modal: scale/mode colour
    pub fn default_layout() -> Self {
        let segments = default_segments();
        Self::new(DEFAULT_DIMENSION, segments).unwrap_or_else(|e| {
            unreachable!("built-in schema layout is invalid: {e}");
        })
    }

    pub fn total_dimension(&self) -> usize {
        self.total_dimension
    }

    /// Segments in declaration order
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Segments that participate in weighted scoring
    pub fn scored_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| !s.unused)
    }

    pub fn segment(&self, name: &str) -> Result<&Segment, SchemaError> {
        self.by_name
            .get(name)
            .map(|&i| &self.segments[i])
            .ok_or_else(|| SchemaError::UnknownSegment(name.to_string()))
    }

    /// Offset and length of a named segment
    pub fn segment_slice(&self, name: &str) -> Result<(usize, usize), SchemaError> {
        self.segment(name).map(|s| (s.offset, s.length))
    }

    /// Reject vectors whose length differs from the schema dimension
    pub fn validate_vector(&self, vector: &[f32]) -> Result<(), SearchError> {
        if vector.len() != self.total_dimension {
            return Err(SearchError::InvalidVectorLength {
                expected: self.total_dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

const DEFAULT_DIMENSION: usize = 384;

pub fn default_segments() -> Vec<Segment> {
    vec![
        Segment::unused("identity", 0, 12),
        Segment::new("structure", 12, 96),
        Segment::new("morphology", 108, 96),
        Segment::new("context", 204, 64),
        Segment::new("symbolic", 268, 48),
        Segment::new("modal", 316, 68),
    ]
}
