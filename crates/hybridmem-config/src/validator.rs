//! Configuration validation.

use hybridmem_protocols::{DistanceMetric, Quantization};

use crate::error::ConfigError;
use crate::schema::{Config, EngineConfig};

/// Validation result.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// First error as a [`ConfigError`], if any.
    pub fn into_result(self) -> Result<Vec<ValidationWarning>, ConfigError> {
        match self.errors.into_iter().next() {
            Some(err) => Err(ConfigError::InvalidValue {
                field: err.path,
                message: err.message,
            }),
            None => Ok(self.warnings),
        }
    }
}

/// A validation error.
#[derive(Debug)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A validation warning.
#[derive(Debug)]
pub struct ValidationWarning {
    pub path: String,
    pub message: String,
}

impl ValidationWarning {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration.
    pub fn validate(config: &Config) -> Result<ValidationResult, ConfigError> {
        let mut result = Self::validate_engine(&config.engine);

        if config.logging.filter.trim().is_empty() {
            result.add_error(ValidationError::new("logging.filter", "filter cannot be empty"));
        }

        Ok(result)
    }

    /// Validate the engine section alone.
    pub fn validate_engine(engine: &EngineConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_index(engine, &mut result);
        Self::validate_quantization(engine, &mut result);
        Self::validate_limits(engine, &mut result);
        Self::validate_storage(engine, &mut result);

        result
    }

    fn validate_index(engine: &EngineConfig, result: &mut ValidationResult) {
        if engine.dimensions == 0 {
            result.add_error(ValidationError::new(
                "engine.dimensions",
                "dimensions must be greater than 0",
            ));
        }

        if engine.hnsw_m < 2 {
            result.add_error(ValidationError::new("engine.hnsw_m", "hnsw_m must be at least 2"));
        }

        if engine.hnsw_ef_construction == 0 {
            result.add_error(ValidationError::new(
                "engine.hnsw_ef_construction",
                "hnsw_ef_construction must be greater than 0",
            ));
        } else if engine.hnsw_ef_construction < engine.hnsw_m {
            result.add_warning(ValidationWarning::new(
                "engine.hnsw_ef_construction",
                "hnsw_ef_construction is below hnsw_m, graph quality will suffer",
            ));
        }

        if engine.hnsw_ef_search == 0 {
            result.add_error(ValidationError::new(
                "engine.hnsw_ef_search",
                "hnsw_ef_search must be greater than 0",
            ));
        } else if engine.hnsw_ef_search < 10 {
            result.add_warning(ValidationWarning::new(
                "engine.hnsw_ef_search",
                "hnsw_ef_search is very low (<10), recall may drop sharply",
            ));
        }
    }

    fn validate_quantization(engine: &EngineConfig, result: &mut ValidationResult) {
        match engine.quantization {
            Quantization::Product => {
                if engine.pq_subspaces == 0 {
                    result.add_error(ValidationError::new(
                        "engine.pq_subspaces",
                        "pq_subspaces must be greater than 0",
                    ));
                } else if engine.dimensions % engine.pq_subspaces != 0 {
                    result.add_error(ValidationError::new(
                        "engine.pq_subspaces",
                        format!(
                            "pq_subspaces ({}) must divide dimensions ({})",
                            engine.pq_subspaces, engine.dimensions
                        ),
                    ));
                }
            }
            Quantization::Binary if engine.distance_metric == DistanceMetric::Euclidean => {
                result.add_warning(ValidationWarning::new(
                    "engine.quantization",
                    "binary quantization keeps only signs, euclidean magnitudes are lost",
                ));
            }
            _ => {}
        }
    }

    fn validate_limits(engine: &EngineConfig, result: &mut ValidationResult) {
        let positive = [
            ("engine.cache_size", engine.cache_size as u64),
            ("engine.max_entries", engine.max_entries),
            ("engine.max_payload_bytes", engine.max_payload_bytes as u64),
            ("engine.embed_concurrency", engine.embed_concurrency as u64),
            ("engine.default_deadline_ms", engine.default_deadline_ms),
            ("engine.reader_connections", engine.reader_connections as u64),
        ];
        for (path, value) in positive {
            if value == 0 {
                result.add_error(ValidationError::new(path, "must be greater than 0"));
            }
        }

        if engine.cache_ttl_ms == 0 {
            result.add_warning(ValidationWarning::new(
                "engine.cache_ttl_ms",
                "cache_ttl_ms is 0, cached results expire immediately",
            ));
        }

        if engine.max_payload_bytes > 1024 * 1024 * 1024 {
            result.add_warning(ValidationWarning::new(
                "engine.max_payload_bytes",
                "max_payload_bytes exceeds 1 GiB",
            ));
        }

        if engine.purge_interval_ms == Some(0) {
            result.add_error(ValidationError::new(
                "engine.purge_interval_ms",
                "purge_interval_ms must be greater than 0 when set",
            ));
        }

        if !engine.dual_write {
            result.add_warning(ValidationWarning::new(
                "engine.dual_write",
                "dual_write is off, embeddings are indexed only by reconcile",
            ));
        }
    }

    fn validate_storage(engine: &EngineConfig, result: &mut ValidationResult) {
        if let Some(dir) = &engine.data_dir {
            if dir.exists() && !dir.is_dir() {
                result.add_error(ValidationError::new(
                    "engine.data_dir",
                    format!("data_dir is not a directory: {:?}", dir),
                ));
            }
        }
    }
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;
