//! Configuration structures for capsule.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, epoch ticking)
//! - [`ExecutionConfig`]: Per-call execution limits and guest ABI names
//! - [`PoolConfig`]: Instance pool sizing and wait limits

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

/// Largest allowed `max_memory_mb`.
///
/// Packed results carry a 31-bit pointer, so guest memory must stay below 2 GiB.
pub const MAX_MEMORY_MB: u32 = 2048;

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for the runtime.
/// It can be loaded from files (TOML, JSON).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-call execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Instance pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Wasmtime engine configuration.
///
/// These settings affect the global Wasmtime engine behavior,
/// including memory allocation strategy and time-based interruption.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable the pooling allocator for instance memory.
    ///
    /// When enabled, memory for `max_instances` instances is reserved up front.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances across all pools.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Enable epoch-based interruption.
    ///
    /// A background ticker advances the engine epoch so long-running
    /// guest code can be interrupted based on wall-clock time.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,

    /// Interval between epoch ticks in milliseconds.
    #[serde(default = "defaults::epoch_tick_ms")]
    pub epoch_tick_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            epoch_interruption: defaults::epoch_interruption(),
            epoch_tick_ms: defaults::epoch_tick_ms(),
        }
    }
}

impl EngineConfig {
    /// Get the epoch tick interval as a `Duration`.
    pub fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms.max(1))
    }
}

/// Per-call execution configuration.
///
/// These settings control resource limits for individual guest calls
/// and the names of the exports the host relies on.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Maximum fuel (CPU instructions) per call.
    ///
    /// A typical simple function consumes ~1,000-10,000 fuel.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Enable fuel metering.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,

    /// Execution timeout in milliseconds.
    ///
    /// Enforced through epoch interruption when it is enabled.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum linear memory per instance in megabytes.
    #[serde(default = "defaults::max_memory_mb")]
    pub max_memory_mb: u32,

    /// Name of the guest export used to allocate memory for host data.
    #[serde(default = "defaults::allocate_export")]
    pub allocate_export: String,

    /// Link WASI preview1 imports for guests built against `wasm32-wasip1`.
    #[serde(default = "defaults::wasi")]
    pub wasi: bool,

    /// Forward guest stdout/stderr to the host process.
    #[serde(default = "defaults::inherit_stdio")]
    pub inherit_stdio: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_fuel: defaults::max_fuel(),
            fuel_metering: defaults::fuel_metering(),
            timeout_ms: defaults::timeout_ms(),
            max_memory_mb: defaults::max_memory_mb(),
            allocate_export: defaults::allocate_export(),
            wasi: defaults::wasi(),
            inherit_stdio: defaults::inherit_stdio(),
        }
    }
}

impl ExecutionConfig {
    /// Get the timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Get the memory limit in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        (self.max_memory_mb as usize) * 1024 * 1024
    }

    /// Reject limits the guest ABI cannot address.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.max_memory_mb > MAX_MEMORY_MB {
            return Err(RuntimeError::invalid_config(format!(
                "max_memory_mb is {}, but results can only address {MAX_MEMORY_MB} MB",
                self.max_memory_mb
            )));
        }
        Ok(())
    }
}

/// Instance pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Pool size used when a module does not specify one.
    #[serde(default = "defaults::pool_size")]
    pub default_size: usize,

    /// How long a checkout waits when the caller sets no deadline.
    ///
    /// Zero means wait without a limit.
    #[serde(default = "defaults::checkout_timeout_ms")]
    pub checkout_timeout_ms: u64,

    /// How long shutdown waits for leased instances to come back.
    #[serde(default = "defaults::drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_size: defaults::pool_size(),
            checkout_timeout_ms: defaults::checkout_timeout_ms(),
            drain_timeout_ms: defaults::drain_timeout_ms(),
        }
    }
}

impl PoolConfig {
    /// Get the default checkout timeout, or `None` if waits are unbounded.
    pub fn checkout_timeout(&self) -> Option<Duration> {
        (self.checkout_timeout_ms > 0).then(|| Duration::from_millis(self.checkout_timeout_ms))
    }

    /// Get the drain timeout as a `Duration`.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        false
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn epoch_tick_ms() -> u64 {
        10
    }

    pub const fn max_fuel() -> u64 {
        10_000_000
    }

    pub const fn fuel_metering() -> bool {
        true
    }

    pub const fn timeout_ms() -> u64 {
        10_000
    }

    pub const fn max_memory_mb() -> u32 {
        64
    }

    pub fn allocate_export() -> String {
        "allocate".to_string()
    }

    pub const fn wasi() -> bool {
        true
    }

    pub const fn inherit_stdio() -> bool {
        true
    }

    pub const fn pool_size() -> usize {
        4
    }

    pub const fn checkout_timeout_ms() -> u64 {
        5_000
    }

    pub const fn drain_timeout_ms() -> u64 {
        5_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();

        assert!(!config.engine.pooling_allocator);
        assert_eq!(config.engine.max_instances, 1000);
        assert!(config.engine.epoch_interruption);
        assert_eq!(config.engine.epoch_tick_ms, 10);

        assert_eq!(config.execution.max_fuel, 10_000_000);
        assert_eq!(config.execution.timeout_ms, 10_000);
        assert_eq!(config.execution.allocate_export, "allocate");
        assert!(config.execution.fuel_metering);
        assert!(config.execution.wasi);

        assert_eq!(config.pool.default_size, 4);
        assert_eq!(config.pool.drain_timeout_ms, 5_000);
    }

    #[test]
    fn test_config_serialization() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: RuntimeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(
            config.engine.max_instances,
            deserialized.engine.max_instances
        );
        assert_eq!(config.execution.max_fuel, deserialized.execution.max_fuel);
        assert_eq!(config.pool.default_size, deserialized.pool.default_size);
    }

    #[test]
    fn test_durations() {
        let exec = ExecutionConfig {
            timeout_ms: 500,
            max_memory_mb: 2,
            ..Default::default()
        };
        assert_eq!(exec.timeout(), Duration::from_millis(500));
        assert_eq!(exec.max_memory_bytes(), 2 * 1024 * 1024);

        let engine = EngineConfig {
            epoch_tick_ms: 0,
            ..Default::default()
        };
        assert_eq!(engine.epoch_tick(), Duration::from_millis(1));
    }

    #[test]
    fn test_memory_limit_capped_at_pointer_range() {
        let mut exec = ExecutionConfig {
            max_memory_mb: MAX_MEMORY_MB,
            ..Default::default()
        };
        assert!(exec.validate().is_ok());

        exec.max_memory_mb = MAX_MEMORY_MB + 1;
        let err = exec.validate().unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig { .. }));
    }

    #[test]
    fn test_unbounded_checkout() {
        let pool = PoolConfig {
            checkout_timeout_ms: 0,
            ..Default::default()
        };
        assert!(pool.checkout_timeout().is_none());
        assert_eq!(
            PoolConfig::default().checkout_timeout(),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"pool": {"default_size": 16}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();

        // Explicitly set value
        assert_eq!(config.pool.default_size, 16);
        // Default values for unspecified fields
        assert!(config.engine.epoch_interruption);
        assert_eq!(config.execution.max_fuel, 10_000_000);
    }
}
