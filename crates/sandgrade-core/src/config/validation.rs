//! Sanity checks applied after a configuration has been loaded

use crate::config::types::Settings;
use crate::errors::ConfigError;

impl Settings {
    /// Reject settings the worker cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let broker = &self.broker;
        if broker.exchange.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.exchange must not be empty".to_string()));
        }
        if broker.queue.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.queue must not be empty".to_string()));
        }
        if broker.tag.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.tag must not be empty".to_string()));
        }
        if let Some(url) = &broker.url {
            if !url.starts_with("amqp://") && !url.starts_with("amqps://") {
                return Err(ConfigError::Invalid(format!(
                    "broker.url must be an amqp:// or amqps:// URI, got '{}'",
                    url
                )));
            }
        }

        let sandbox = &self.sandbox;
        if sandbox.timeout.is_zero() {
            return Err(ConfigError::Invalid("sandbox.timeout must be positive".to_string()));
        }
        if sandbox.memory_limit_bytes == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.memory_limit_bytes must be greater than 0".to_string(),
            ));
        }
        if i64::try_from(sandbox.memory_limit_bytes).is_err() {
            return Err(ConfigError::Invalid(
                "sandbox.memory_limit_bytes is too large".to_string(),
            ));
        }
        if sandbox.output_limit_bytes == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.output_limit_bytes must be greater than 0".to_string(),
            ));
        }
        if sandbox.cpu_period <= 0 || sandbox.cpu_quota <= 0 {
            return Err(ConfigError::Invalid(format!(
                "sandbox.cpu_period and sandbox.cpu_quota must be positive (got {}/{})",
                sandbox.cpu_quota, sandbox.cpu_period
            )));
        }

        if self.handler.max_archive_bytes == 0 {
            return Err(ConfigError::Invalid(
                "handler.max_archive_bytes must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
