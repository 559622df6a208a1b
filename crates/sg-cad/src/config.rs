//! Evaluator configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialize(String),
    #[error("Deserialization error: {0}")]
    Deserialize(String),
}

/// Settings of the evaluator and its build cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Maximum number of cached shapes (`None` = unbounded)
    pub cache_capacity: Option<usize>,
    /// Directory for the persistent cache (`None` = in-memory only)
    pub persist_dir: Option<PathBuf>,
    /// Worker threads for parallel evaluation (0 = one per core)
    pub workers: usize,
    /// Never resubmit a hash the kernel already rejected
    pub remember_failures: bool,
    /// How far outside [-1, 1] an arc-cosine argument may be and still be clamped
    pub acos_tolerance: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            cache_capacity: None,
            persist_dir: None,
            workers: 0,
            remember_failures: true,
            acos_tolerance: 1e-9,
        }
    }
}

impl EvaluatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the cache to `capacity` entries (least recently used go first)
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = Some(capacity);
        self
    }

    pub fn with_persist_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persist_dir = Some(dir.into());
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_remember_failures(mut self, remember: bool) -> Self {
        self.remember_failures = remember;
        self
    }

    pub fn with_acos_tolerance(mut self, tolerance: f64) -> Self {
        self.acos_tolerance = tolerance.max(0.0);
        self
    }

    /// Save configuration to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = self.to_ron_string()?;
        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Io(e.to_string()))?;
        Ok(())
    }

    pub fn to_ron_string(&self) -> Result<String, ConfigError> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Load configuration from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_ron_str(&content)
    }

    pub fn from_ron_str(content: &str) -> Result<Self, ConfigError> {
        ron::from_str(content).map_err(|e| ConfigError::Deserialize(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evaluator.ron");
        let config = EvaluatorConfig::new()
            .with_cache_capacity(64)
            .with_persist_dir("/tmp/sg-cache")
            .with_workers(3)
            .with_remember_failures(false);

        config.save(&path).unwrap();
        assert_eq!(EvaluatorConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config = EvaluatorConfig::from_ron_str("(workers: 2)").unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.cache_capacity, None);
        assert!(config.remember_failures);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            EvaluatorConfig::from_ron_str("not ron at all"),
            Err(ConfigError::Deserialize(_))
        ));
        assert!(matches!(
            EvaluatorConfig::load("/nonexistent/evaluator.ron"),
            Err(ConfigError::Io(_))
        ));
    }
}
