//! Configuration module for the worker
//!
//! Settings are read from a YAML file once at process start, adjusted by
//! environment overrides, validated, and then only ever shared read-only.

pub mod types;
pub mod loader;
pub mod validation;

pub use types::*;
pub use loader::*;


use crate::errors::ConfigError;
use std::path::Path;

/// Load settings from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<Settings, ConfigError> {
    ConfigLoader::from_file(path).await
}
