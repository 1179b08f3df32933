//! Configuration module
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::session::assembler::MIN_PART_SIZE;

mod loader;

pub use loader::ConfigLoader;

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
fn expand_env_vars(s: &str) -> String {
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]+))?\}").unwrap();
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in re.captures_iter(s) {
        let full_match = cap.get(0).unwrap();
        let var_name = cap.get(1).unwrap().as_str();

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name) {
            Ok(val) => val,
            Err(_) => {
                if let Some(default) = cap.get(2) {
                    default.as_str().to_string()
                } else {
                    full_match.as_str().to_string()
                }
            }
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.server.upload_path.starts_with('/') {
            return Err(ConfigError::ValidationError(
                "server.upload_path must start with /".into(),
            ));
        }

        if self.store.bucket.is_empty() {
            return Err(ConfigError::ValidationError(
                "store.bucket must not be empty".into(),
            ));
        }

        if self.auth.enabled && self.auth.url.is_none() {
            return Err(ConfigError::ValidationError(
                "auth.url is required when auth is enabled".into(),
            ));
        }
        if let Some(url) = &self.auth.url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::ValidationError(
                    "auth.url must start with http:// or https://".into(),
                ));
            }
        }

        Ok(())
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    /// Path prefix upload sessions live under
    #[serde(default = "default_upload_path")]
    pub upload_path: String,
    /// Maximum accepted upload length in bytes; 0 disables the limit
    #[serde(default)]
    pub max_size: u64,
}

fn default_upload_path() -> String {
    "/files".to_string()
}

/// Object-store backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Default bucket, used when auth is disabled
    pub bucket: String,
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Storage part size; floored at the S3 5MB minimum
    #[serde(default = "default_part_size")]
    pub part_size: usize,
}

impl StoreConfig {
    /// Effective part size, never below the backend minimum
    pub fn effective_part_size(&self) -> usize {
        self.part_size.max(MIN_PART_SIZE)
    }
}

fn default_part_size() -> usize {
    8 * 1024 * 1024
}

/// Identity service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            server: ServerConfig {
                address: "127.0.0.1:1080".into(),
                upload_path: "/files".into(),
                max_size: 0,
            },
            store: StoreConfig {
                bucket: "userdata".into(),
                region: "us-east-1".into(),
                endpoint: None,
                access_key: None,
                secret_key: None,
                part_size: default_part_size(),
            },
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_auth_enabled_requires_url() {
        let mut config = base_config();
        config.auth.enabled = true;
        assert!(config.validate().is_err());

        config.auth.url = Some("https://identity.example.com/check".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_upload_path_must_be_absolute() {
        let mut config = base_config();
        config.server.upload_path = "files".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_part_size_floored_at_backend_minimum() {
        let mut config = base_config();
        config.store.part_size = 1024;
        assert_eq!(config.store.effective_part_size(), MIN_PART_SIZE);

        config.store.part_size = 16 * 1024 * 1024;
        assert_eq!(config.store.effective_part_size(), 16 * 1024 * 1024);
    }

    #[test]
    fn test_expand_env_vars_with_default() {
        let out = expand_env_vars("${TUS_TEST_NOT_SET:-fallback}");
        assert_eq!(out, "fallback");
    }

    #[test]
    fn test_expand_env_vars_keeps_unknown_placeholder() {
        let out = expand_env_vars("prefix-${TUS_TEST_NOT_SET}");
        assert_eq!(out, "prefix-${TUS_TEST_NOT_SET}");
    }
}
