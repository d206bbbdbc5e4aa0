// src/config.rs

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tuning shared by every transfer a manager runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ManagerConfig {
    /// Maximum number of bytes read per loop iteration. Pause and cancel are
    /// honoured between chunks, so this bounds their latency.
    pub chunk_size: usize,
    /// Buffer capacity reserved when the source announces no length.
    pub initial_capacity: usize,
    /// Upper bound on the capacity reserved from an announced length. `0`
    /// ignores announced lengths and always starts at `initial_capacity`.
    pub max_preallocation: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 8 * 1024,
            initial_capacity: 16 * 1024,
            max_preallocation: 64 * 1024 * 1024,
        }
    }
}

impl ManagerConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: ManagerConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a TOML config file.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be greater than zero".into()));
        }
        if self.initial_capacity == 0 {
            return Err(ConfigError::Invalid(
                "initial_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Capacity to reserve for a fresh transfer given the announced length.
    pub(crate) fn capacity_for(&self, content_length: Option<u64>) -> usize {
        match content_length {
            Some(len) if self.max_preallocation > 0 => usize::try_from(len)
                .unwrap_or(usize::MAX)
                .min(self.max_preallocation),
            _ => self.initial_capacity,
        }
    }
}
