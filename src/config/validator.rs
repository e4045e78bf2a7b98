use crate::config::{Config, AUTO_STRATEGY, SCHEMA_VERSION};
use crate::error::{FretError, Result, ValidationError};
use crate::strategy::{GPU, IN_MEMORY, PERSISTENT_STORE};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration, collecting every problem found
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_storage(config, &mut errors);
        Self::validate_daemon(config, &mut errors);
        Self::validate_embedding(config, &mut errors);
        Self::validate_schema_and_presets(config, &mut errors);
        Self::validate_search(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(FretError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != SCHEMA_VERSION {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_storage(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.storage.data_dir.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.data_dir",
                "Data directory cannot be empty",
            ));
        }
        if config.storage.database_file.trim().is_empty() {
            errors.push(ValidationError::new(
                "storage.database_file",
                "Database file name cannot be empty",
            ));
        }
    }

    fn validate_daemon(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.daemon.socket_path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "daemon.socket_path",
                "Socket path cannot be empty",
            ));
        }
        if config.daemon.max_connections == 0 {
            errors.push(ValidationError::new(
                "daemon.max_connections",
                "Max connections must be greater than 0",
            ));
        }
    }

    fn validate_embedding(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.embedding.model.is_empty() {
            errors.push(ValidationError::new(
                "embedding.model",
                "Model name cannot be empty",
            ));
        }
        if config.embedding.batch_size == 0 {
            errors.push(ValidationError::new(
                "embedding.batch_size",
                "Batch size must be greater than 0",
            ));
        }
        if config.embedding.max_concurrency == 0 {
            errors.push(ValidationError::new(
                "embedding.max_concurrency",
                "Max concurrency must be greater than 0",
            ));
        }
    }

    fn validate_schema_and_presets(config: &Config, errors: &mut Vec<ValidationError>) {
        let schema = match config.build_schema() {
            Ok(schema) => schema,
            Err(e) => {
                errors.push(ValidationError::new("schema.segments", e.to_string()));
                return;
            }
        };

        for preset in &config.presets {
            if let Err(e) = preset.validate(&schema) {
                errors.push(ValidationError::new(
                    format!("presets.{}", preset.name),
                    e.to_string(),
                ));
            }
        }
    }

    fn validate_search(config: &Config, errors: &mut Vec<ValidationError>) {
        let strategy = config.search.default_strategy.as_str();
        let valid = [AUTO_STRATEGY, IN_MEMORY, GPU, PERSISTENT_STORE];
        if !valid.contains(&strategy) {
            errors.push(ValidationError::new(
                "search.default_strategy",
                format!("Strategy must be one of {:?}, got '{}'", valid, strategy),
            ));
        }
        if strategy == GPU && !config.search.enable_gpu {
            errors.push(ValidationError::new(
                "search.default_strategy",
                "GPU selected but search.enable_gpu is false",
            ));
        }
        if strategy == PERSISTENT_STORE && !config.search.enable_persistent_store {
            errors.push(ValidationError::new(
                "search.default_strategy",
                "PersistentStore selected but search.enable_persistent_store is false",
            ));
        }

        if config.search.default_top_k == 0 {
            errors.push(ValidationError::new(
                "search.default_top_k",
                "Default top_k must be greater than 0",
            ));
        }
        if config.search.benchmark_iterations == 0 {
            errors.push(ValidationError::new(
                "search.benchmark_iterations",
                "Benchmark iterations must be greater than 0",
            ));
        }
    }
}
