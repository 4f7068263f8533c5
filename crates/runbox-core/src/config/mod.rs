//! Engine configuration.
//!
//! YAML documents are parsed into [`RunboxConfig`] and validated before use.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;

#[cfg(test)]
mod tests;

use crate::errors::ConfigError;
use std::path::Path;

/// Load a configuration from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<RunboxConfig, ConfigError> {
    ConfigLoader::from_file(path).await
}
