//! Configuration file structures for capsule.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`CapabilitiesConfig`]: Which capability handlers the host exposes
//! - [`ModuleEntry`]: Pre-loaded module definition

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.execution]
/// max_fuel = 10_000_000
/// timeout_ms = 2_000
///
/// [runtime.pool]
/// default_size = 8
///
/// [capabilities.httpclient]
/// enabled = true
/// timeout_secs = 30
///
/// [capabilities.kvstore]
/// enabled = true
///
/// [[modules]]
/// name = "hello"
/// path = "./modules/hello.wasm"
/// pool_size = 4
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (engine, execution and pool settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Capability handler configuration.
    #[serde(default)]
    pub capabilities: CapabilitiesConfig,

    /// Modules to load at startup.
    #[serde(default)]
    pub modules: Vec<ModuleEntry>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML or
    /// if a module entry is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check module entries for empty names, zero pool sizes and duplicates.
    pub fn validate(&self) -> Result<(), ConfigFileError> {
        let mut seen = std::collections::HashSet::new();
        for module in &self.modules {
            if module.name.trim().is_empty() {
                return Err(ConfigFileError::InvalidModule {
                    name: module.name.clone(),
                    reason: "name must not be empty".into(),
                });
            }
            if module.pool_size == Some(0) {
                return Err(ConfigFileError::InvalidModule {
                    name: module.name.clone(),
                    reason: "pool_size must be greater than zero".into(),
                });
            }
            if !seen.insert(module.name.as_str()) {
                return Err(ConfigFileError::InvalidModule {
                    name: module.name.clone(),
                    reason: "declared more than once".into(),
                });
            }
        }
        Ok(())
    }
}

/// Capability handler configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CapabilitiesConfig {
    /// Outbound HTTP client (`httpclient` namespace).
    #[serde(default)]
    pub httpclient: HttpClientConfig,

    /// In-memory key-value store (`kvstore` namespace).
    #[serde(default)]
    pub kvstore: ToggleConfig,

    /// Guest logging (`logger` namespace).
    #[serde(default)]
    pub logger: ToggleConfig,
}

/// Settings for the outbound HTTP capability.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpClientConfig {
    /// Expose the capability to guests.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Whole-request timeout in seconds.
    #[serde(default = "defaults::http_timeout_secs")]
    pub timeout_secs: u64,

    /// Connection timeout in seconds.
    #[serde(default = "defaults::http_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Largest response body accepted, in bytes.
    #[serde(default = "defaults::http_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            timeout_secs: defaults::http_timeout_secs(),
            connect_timeout_secs: defaults::http_connect_timeout_secs(),
            max_body_bytes: defaults::http_max_body_bytes(),
        }
    }
}

/// On/off switch for capabilities without further settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToggleConfig {
    /// Expose the capability to guests.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
}

impl Default for ToggleConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
        }
    }
}

/// A module entry to load at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModuleEntry {
    /// Unique name of the module in the registry.
    pub name: String,

    /// Path to the WebAssembly module file.
    pub path: String,

    /// Number of pooled instances; falls back to `runtime.pool.default_size`.
    #[serde(default)]
    pub pool_size: Option<usize>,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },

    /// A module entry is not usable.
    #[error("Invalid module entry '{name}': {reason}")]
    InvalidModule { name: String, reason: String },
}

/// Default value functions for serde.
mod defaults {
    pub const fn enabled() -> bool {
        true
    }

    pub const fn http_timeout_secs() -> u64 {
        30
    }

    pub const fn http_connect_timeout_secs() -> u64 {
        10
    }

    pub const fn http_max_body_bytes() -> usize {
        10 * 1024 * 1024
    }
}
