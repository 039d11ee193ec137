//! Common types, errors, and configuration for capsule.
//!
//! This crate provides shared functionality used across the capsule workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for runtime settings
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{EngineConfig, ExecutionConfig, MAX_MEMORY_MB, PoolConfig, RuntimeConfig};
pub use config_file::{
    CapabilitiesConfig, ConfigFile, ConfigFileError, HttpClientConfig, ModuleEntry, ToggleConfig,
};
pub use error::{CallbackError, RuntimeError};
