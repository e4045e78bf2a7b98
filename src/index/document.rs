use crate::embedding::fingerprint;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{FretError, Result};

/// A fretted chord voicing with search metadata and an optional embedding
///
/// Field names serialize in camelCase to match the ingestion producers'
/// persisted shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoicingDocument {
    pub id: String,
    pub chord_name: String,
    pub root_pitch_class: u8,
    #[serde(default)]
    pub pitch_classes: Vec<u8>,
    #[serde(default)]
    pub midi_notes: Vec<u8>,
    /// Compact fret positions, low string first (e.g. "x32000")
    #[serde(default)]
    pub diagram: String,
    #[serde(default)]
    pub searchable_text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

impl VoicingDocument {
    pub fn new(id: impl Into<String>, chord_name: impl Into<String>, root_pitch_class: u8) -> Self {
        Self {
            id: id.into(),
            chord_name: chord_name.into(),
            root_pitch_class,
            pitch_classes: Vec::new(),
            midi_notes: Vec::new(),
            diagram: String::new(),
            searchable_text: String::new(),
            tags: Vec::new(),
            embedding: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Text handed to the embedding model; falls back to name and diagram
    pub fn embedding_text(&self) -> String {
        if self.searchable_text.is_empty() {
            format!("{} {}", self.chord_name, self.diagram).trim().to_string()
        } else {
            self.searchable_text.clone()
        }
    }

    /// Fingerprint of the content the embedding is derived from
    pub fn content_fingerprint(&self) -> String {
        fingerprint(&self.embedding_text())
    }

    pub fn has_embedding(&self) -> bool {
        self.embedding.is_some()
    }
}

/// Load a JSON array of documents written by an ingestion producer
pub fn load_documents(path: &Path) -> Result<Vec<VoicingDocument>> {
    let content = std::fs::read_to_string(path).map_err(|e| FretError::Io {
        source: e,
        context: format!("Failed to read documents file: {:?}", path),
    })?;
    serde_json::from_str(&content).map_err(|e| FretError::Json {
        source: e,
        context: format!("Failed to parse documents file: {:?}", path),
    })
}
