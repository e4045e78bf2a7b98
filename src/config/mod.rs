//! Configuration management for fretsearch
//!
//! Configuration is a TOML file (default `~/.config/fretsearch/config.toml`)
//! validated on load. Environment variables of the form
//! `FRETSEARCH_SECTION__KEY` override file values, and named profiles can
//! override a subset of keys.

use crate::embedding::{default_segments, EmbeddingSchema, SchemaError, Segment};
use crate::error::{FretError, Result};
use crate::retrieval::SearchPreset;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

mod validator;

pub use validator::ConfigValidator;

pub const SCHEMA_VERSION: &str = "1.0.0";

/// `search.default_strategy` value that runs auto-selection at startup
pub const AUTO_STRATEGY: &str = "auto";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    pub storage: StorageConfig,
    pub daemon: DaemonConfig,
    pub embedding: EmbeddingConfig,
    pub schema: SchemaConfig,
    pub search: SearchConfig,
    /// Extra or replacement weight presets
    #[serde(default)]
    pub presets: Vec<SearchPreset>,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileOverrides>,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// SQLite file name under `data_dir`
    pub database_file: String,
    /// JSON array of voicings loaded at startup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documents_file: Option<PathBuf>,
}

/// Daemon configuration for IPC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub max_connections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub model: String,
    pub batch_size: usize,
    /// Concurrent provider calls during backfill
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    pub total_dimension: usize,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// "auto", "InMemory", "GPU" or "PersistentStore"
    pub default_strategy: String,
    pub default_top_k: usize,
    pub benchmark_iterations: usize,
    pub enable_gpu: bool,
    /// CUDA device ordinal
    pub gpu_device: usize,
    pub enable_persistent_store: bool,
}

/// Profile-specific configuration overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_gpu: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_persistent_store: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FretError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| FretError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();
        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Load the file at `path` if it exists, otherwise defaults with env overrides
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        tracing::debug!("No config at {:?}, using defaults", path);
        let mut config = Self::default();
        config.apply_env_overrides();
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FretError::Io {
                source: e,
                context: format!("Failed to create config directory: {:?}", parent),
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| FretError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Load configuration with a specific profile applied
    pub fn load_with_profile(path: &Path, profile: &str) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_profile(profile)?;
        Ok(config)
    }

    /// Apply a profile's overrides to the configuration
    pub fn apply_profile(&mut self, profile: &str) -> Result<()> {
        let overrides = self
            .profiles
            .get(profile)
            .cloned()
            .ok_or_else(|| FretError::Config(format!("Unknown profile: {}", profile)))?;

        if let Some(strategy) = overrides.default_strategy {
            self.search.default_strategy = strategy;
        }
        if let Some(enabled) = overrides.enable_gpu {
            self.search.enable_gpu = enabled;
        }
        if let Some(enabled) = overrides.enable_persistent_store {
            self.search.enable_persistent_store = enabled;
        }
        if let Some(model) = overrides.embedding_model {
            self.embedding.model = model;
        }

        ConfigValidator::validate(self)
    }

    /// Apply environment variable overrides
    /// Environment variables in format: FRETSEARCH_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(std::env::vars());
    }

    fn apply_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(config_key) = key.strip_prefix("FRETSEARCH_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "STORAGE__DATA_DIR" => self.storage.data_dir = PathBuf::from(value),
            "STORAGE__DOCUMENTS_FILE" => self.storage.documents_file = Some(PathBuf::from(value)),
            "DAEMON__SOCKET_PATH" => self.daemon.socket_path = PathBuf::from(value),
            "EMBEDDING__MODEL" => self.embedding.model = value.to_string(),
            "EMBEDDING__MAX_CONCURRENCY" => {
                self.embedding.max_concurrency = parse_value(path, value)?
            }
            "SEARCH__DEFAULT_STRATEGY" => self.search.default_strategy = value.to_string(),
            "SEARCH__DEFAULT_TOP_K" => self.search.default_top_k = parse_value(path, value)?,
            "SEARCH__ENABLE_GPU" => self.search.enable_gpu = parse_value(path, value)?,
            "SEARCH__GPU_DEVICE" => self.search.gpu_device = parse_value(path, value)?,
            "SEARCH__ENABLE_PERSISTENT_STORE" => {
                self.search.enable_persistent_store = parse_value(path, value)?
            }
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Build the embedding schema described by `[schema]`
    pub fn build_schema(&self) -> std::result::Result<EmbeddingSchema, SchemaError> {
        EmbeddingSchema::new(self.schema.total_dimension, self.schema.segments.clone())
    }

    pub fn data_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.data_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join(&self.storage.database_file)
    }

    pub fn socket_path(&self) -> PathBuf {
        expand_tilde(&self.daemon.socket_path)
    }

    pub fn documents_path(&self) -> Option<PathBuf> {
        self.storage.documents_file.as_deref().map(expand_tilde)
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| FretError::Config("Cannot determine config directory".to_string()))?;

        Ok(config_dir.join("fretsearch").join("config.toml"))
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = PathBuf::from("~/.fretsearch");

        Self {
            meta: MetaConfig {
                schema_version: SCHEMA_VERSION.to_string(),
                created_at: current_timestamp(),
                last_modified: current_timestamp(),
            },
            storage: StorageConfig {
                data_dir: data_dir.clone(),
                database_file: "voicings.sqlite".to_string(),
                documents_file: None,
            },
            daemon: DaemonConfig {
                socket_path: data_dir.join("daemon.sock"),
                max_connections: 32,
            },
            embedding: EmbeddingConfig {
                model: "all-MiniLM-L6-v2".to_string(),
                batch_size: 32,
                max_concurrency: 4,
            },
            schema: SchemaConfig {
                total_dimension: 384,
                segments: default_segments(),
            },
            search: SearchConfig {
                default_strategy: AUTO_STRATEGY.to_string(),
                default_top_k: 10,
                benchmark_iterations: 100,
                enable_gpu: true,
                gpu_device: 0,
                enable_persistent_store: true,
            },
            presets: Vec::new(),
            profiles: HashMap::new(),
        }
    }
}

fn parse_value<T: std::str::FromStr>(path: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| FretError::InvalidConfigValue {
        path: path.to_string(),
        message: format!("Cannot parse '{}'", value),
    })
}

/// Expand a leading `~` to the home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_round_trips_through_toml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        let mut config = Config::default();
        config
            .presets
            .push(SearchPreset::new("voice-leading", [("structure", 1.0)]));
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.schema.segments, default_segments());
        assert_eq!(loaded.presets.len(), 1);
        assert_eq!(loaded.build_schema().unwrap().total_dimension(), 384);
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load(Path::new("/nonexistent/fretsearch.toml"));
        assert!(matches!(result, Err(FretError::ConfigNotFound { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(vec![
            ("FRETSEARCH_SEARCH__DEFAULT_STRATEGY".to_string(), "GPU".to_string()),
            ("FRETSEARCH_SEARCH__ENABLE_GPU".to_string(), "false".to_string()),
            ("FRETSEARCH_SEARCH__DEFAULT_TOP_K".to_string(), "not-a-number".to_string()),
            ("OTHER_SEARCH__GPU_DEVICE".to_string(), "3".to_string()),
        ]);
        assert_eq!(config.search.default_strategy, "GPU");
        assert!(!config.search.enable_gpu);
        assert_eq!(config.search.default_top_k, 10);
        assert_eq!(config.search.gpu_device, 0);
    }

    #[test]
    fn test_profile_overrides() {
        let mut config = Config::default();
        config.profiles.insert(
            "laptop".to_string(),
            ProfileOverrides {
                default_strategy: Some("InMemory".to_string()),
                enable_gpu: Some(false),
                ..Default::default()
            },
        );
        config.apply_profile("laptop").unwrap();
        assert_eq!(config.search.default_strategy, "InMemory");
        assert!(!config.search.enable_gpu);
        assert!(config.apply_profile("studio").is_err());
    }

    #[test]
    fn test_expand_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(
            expand_tilde(Path::new("~/.fretsearch")),
            home.join(".fretsearch")
        );
        assert_eq!(
            expand_tilde(Path::new("/tmp/fretsearch")),
            PathBuf::from("/tmp/fretsearch")
        );
    }
}
