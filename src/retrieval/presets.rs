//! Named segment-weight presets for weighted retrieval

use crate::embedding::{EmbeddingSchema, SchemaError};
use crate::strategy::SearchError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Weight per segment name; segments not listed weigh 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchPreset {
    pub name: String,
    pub weights: BTreeMap<String, f32>,
}

impl SearchPreset {
    pub fn new<I, S>(name: impl Into<String>, weights: I) -> Self
    where
        I: IntoIterator<Item = (S, f32)>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            weights: weights.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Every weighted segment must exist, take part in scoring, and carry a
    /// finite weight. Negative weights penalize similarity on that segment.
    pub fn validate(&self, schema: &EmbeddingSchema) -> Result<(), SchemaError> {
        for (segment, weight) in &self.weights {
            let found = schema.segment(segment)?;
            if found.unused {
                return Err(SchemaError::InvalidWeight {
                    segment: segment.clone(),
                    reason: "segment is declared unused".to_string(),
                });
            }
            if !weight.is_finite() {
                return Err(SchemaError::InvalidWeight {
                    segment: segment.clone(),
                    reason: format!("{} is not a finite number", weight),
                });
            }
        }
        Ok(())
    }
}

/// Presets shipped for the default segment layout
pub fn builtin_presets() -> Vec<SearchPreset> {
    vec![
        SearchPreset::new(
            "balanced",
            [
                ("structure", 0.2),
                ("morphology", 0.2),
                ("context", 0.2),
                ("symbolic", 0.2),
                ("modal", 0.2),
            ],
        ),
        SearchPreset::new(
            "tonal",
            [
                ("modal", 0.4),
                ("structure", 0.3),
                ("context", 0.2),
                ("symbolic", 0.1),
            ],
        ),
        SearchPreset::new(
            "shape",
            [("morphology", 0.6), ("structure", 0.2), ("symbolic", 0.2)],
        ),
        SearchPreset::new(
            "functional",
            [("context", 0.5), ("structure", 0.3), ("modal", 0.2)],
        ),
        SearchPreset::new(
            "color",
            [("symbolic", 0.4), ("modal", 0.3), ("structure", 0.3)],
        ),
    ]
}

/// Presets validated against one schema, looked up by exact name
#[derive(Debug, Clone, Default)]
pub struct PresetRegistry {
    presets: BTreeMap<String, SearchPreset>,
}

impl PresetRegistry {
    /// Strict registry: every preset must validate
    pub fn new(schema: &EmbeddingSchema, presets: Vec<SearchPreset>) -> Result<Self, SchemaError> {
        let mut registry = Self::default();
        for preset in presets {
            registry.insert(schema, preset)?;
        }
        Ok(registry)
    }

    /// Built-in presets the schema can express, then `overrides` on top
    ///
    /// A built-in naming a segment the schema lacks is skipped; an override
    /// that fails validation is an error.
    pub fn with_builtins(
        schema: &EmbeddingSchema,
        overrides: Vec<SearchPreset>,
    ) -> Result<Self, SchemaError> {
        let mut registry = Self::default();
        for preset in builtin_presets() {
            match preset.validate(schema) {
                Ok(()) => {
                    registry.presets.insert(preset.name.clone(), preset);
                }
                Err(e) => debug!("Skipping built-in preset {}: {}", preset.name, e),
            }
        }
        for preset in overrides {
            registry.insert(schema, preset)?;
        }
        Ok(registry)
    }

    /// Add or replace a preset
    pub fn insert(&mut self, schema: &EmbeddingSchema, preset: SearchPreset) -> Result<(), SchemaError> {
        preset.validate(schema)?;
        self.presets.insert(preset.name.clone(), preset);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&SearchPreset, SearchError> {
        self.presets
            .get(name)
            .ok_or_else(|| SearchError::InvalidPreset(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.presets.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::Segment;

    #[test]
    fn test_builtins_fit_default_layout() {
        let registry =
            PresetRegistry::with_builtins(&EmbeddingSchema::default_layout(), Vec::new()).unwrap();
        assert_eq!(
            registry.names(),
            vec!["balanced", "color", "functional", "shape", "tonal"]
        );
    }

    #[test]
    fn test_lookup_is_exact() {
        let registry =
            PresetRegistry::with_builtins(&EmbeddingSchema::default_layout(), Vec::new()).unwrap();
        assert!(registry.get("tonal").is_ok());
        assert_eq!(
            registry.get("Tonal").unwrap_err(),
            SearchError::InvalidPreset("Tonal".to_string())
        );
    }

    #[test]
    fn test_builtins_skipped_for_custom_schema() {
        let schema = EmbeddingSchema::new(4, vec![Segment::new("pitch", 0, 4)]).unwrap();
        let registry = PresetRegistry::with_builtins(
            &schema,
            vec![SearchPreset::new("pitch-only", [("pitch", 1.0)])],
        )
        .unwrap();
        assert_eq!(registry.names(), vec!["pitch-only"]);
    }

    #[test]
    fn test_invalid_overrides_rejected() {
        let schema = EmbeddingSchema::default_layout();
        assert!(PresetRegistry::with_builtins(
            &schema,
            vec![SearchPreset::new("rhythm", [("rhythm", 1.0)])]
        )
        .is_err());
        assert!(PresetRegistry::new(
            &schema,
            vec![SearchPreset::new("identity", [("identity", 1.0)])]
        )
        .is_err());
        assert!(PresetRegistry::new(
            &schema,
            vec![SearchPreset::new("nan", [("modal", f32::NAN)])]
        )
        .is_err());
        assert!(PresetRegistry::new(
            &schema,
            vec![SearchPreset::new("inf", [("modal", f32::INFINITY)])]
        )
        .is_err());
    }

    #[test]
    fn test_negative_weight_accepted() {
        let schema = EmbeddingSchema::default_layout();
        let registry = PresetRegistry::new(
            &schema,
            vec![SearchPreset::new("not-modal", [("structure", 1.0), ("modal", -0.5)])],
        )
        .unwrap();
        assert_eq!(registry.get("not-modal").unwrap().weights["modal"], -0.5);
    }
}
