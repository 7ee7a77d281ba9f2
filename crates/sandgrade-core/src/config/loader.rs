//! Configuration loader for YAML files and environment overrides
//!
//! Deployment files carry the static topology; the handful of values that
//! differ between environments (broker URL, routing key, staging directory)
//! can be overridden through `SANDGRADE_*` variables without editing YAML.

use crate::config::types::Settings;
use crate::errors::ConfigError;
use std::env;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const ENV_BROKER_URL: &str = "SANDGRADE_BROKER_URL";
pub const ENV_ROUTING_KEY: &str = "SANDGRADE_ROUTING_KEY";
pub const ENV_WORKDIR: &str = "SANDGRADE_WORKDIR";

/// Configuration loader with environment resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Settings, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
        log::debug!("Read {} bytes of configuration from {}", content.len(), path.display());

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<Settings, ConfigError> {
        // An empty document means "all defaults"
        let mut settings: Settings = if content.trim().is_empty() {
            Settings::default()
        } else {
            serde_yaml::from_str(content)?
        };

        Self::resolve_environment(&mut settings);
        settings.validate()?;

        Ok(settings)
    }

    fn resolve_environment(settings: &mut Settings) {
        if let Some(url) = non_empty_var(ENV_BROKER_URL) {
            log::debug!("Broker URL overridden by {}", ENV_BROKER_URL);
            settings.broker.url = Some(url);
        }
        if let Some(key) = non_empty_var(ENV_ROUTING_KEY) {
            settings.broker.routing_key = key;
        }
        if let Some(workdir) = non_empty_var(ENV_WORKDIR) {
            settings.handler.workdir = PathBuf::from(workdir);
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}
