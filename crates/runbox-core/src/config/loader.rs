//! Configuration loader for YAML files

use std::path::Path;
use tokio::fs;

use crate::config::types::RunboxConfig;
use crate::errors::ConfigError;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<RunboxConfig, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        log::debug!("Loaded configuration from {}", path.display());
        Self::from_str(&content)
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_str(content: &str) -> Result<RunboxConfig, ConfigError> {
        let config: RunboxConfig = if content.trim().is_empty() {
            RunboxConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }
}
