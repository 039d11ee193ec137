//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is the foundation of the runtime. It is:
//! - Thread-safe and shared across every module and pool
//! - The only place bytecode is compiled
//! - Set up with fuel metering and epoch interruption for resource limiting

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use crate::CompiledModule;
use capsule_common::{EngineConfig, RuntimeError};

/// Thread-safe WebAssembly engine wrapper.
///
/// This struct wraps a Wasmtime [`Engine`] and contains no per-call state.
/// Compilation is a pure function of the input bytes, so a single engine is
/// shared by every module the server loads.
///
/// # Configuration
///
/// The engine is configured with:
/// - **Async Support**: Host calls may await capability handlers
/// - **Fuel Metering**: Enables deterministic CPU limiting
/// - **Epoch Interruption**: Enables time-based interruption
/// - **Pooling Allocator** (optional): Pre-allocates instance memory
///
/// # Example
///
/// ```ignore
/// use capsule_common::EngineConfig;
/// use capsule_core::WasmEngine;
///
/// let engine = WasmEngine::new(&EngineConfig::default())?;
/// let module = engine.compile(&std::fs::read("hello.wasm")?)?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The Wasmtime configuration is invalid
    /// - The pooling allocator cannot be initialized
    pub fn new(config: &EngineConfig) -> Result<Self, RuntimeError> {
        let mut wasmtime_config = Config::new();

        // Host calls await capability handlers
        wasmtime_config.async_support(true);

        // Enable fuel metering for deterministic CPU limiting
        wasmtime_config.consume_fuel(true);

        if config.epoch_interruption {
            wasmtime_config.epoch_interruption(true);
        }

        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!("Wasmtime engine initialized");

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    /// Create pooling allocation configuration.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Compile raw WebAssembly bytecode.
    ///
    /// Safe to call from many threads at once; the result is shared by
    /// every instance created from it.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::CompilationFailed`] for malformed or
    /// unsupported bytecode.
    pub fn compile(&self, bytes: &[u8]) -> Result<CompiledModule, RuntimeError> {
        CompiledModule::from_bytes(&self.engine, bytes)
    }

    /// Compile a module from WAT text.
    pub fn compile_wat(&self, wat: &str) -> Result<CompiledModule, RuntimeError> {
        CompiledModule::from_wat(&self.engine, wat)
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Increment the epoch counter.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    /// Number of epoch ticks that cover `timeout_ms`, never less than one.
    pub fn epoch_ticks(&self, timeout_ms: u64) -> u64 {
        let tick = self.config.epoch_tick_ms.max(1);
        timeout_ms.div_ceil(tick).max(1)
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }

    /// Start the background thread that advances the epoch.
    ///
    /// Returns `None` when epoch interruption is disabled. The ticker stops
    /// when the returned handle is stopped or dropped.
    pub fn start_epoch_ticker(&self) -> Result<Option<EpochTicker>, RuntimeError> {
        if !self.config.epoch_interruption {
            return Ok(None);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let engine = Arc::clone(&self.engine);
        let tick = self.config.epoch_tick();
        let flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("capsule-epoch".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(tick);
                    engine.increment_epoch();
                }
            })
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to start epoch ticker: {e}")))?;

        debug!(tick_ms = tick.as_millis(), "Epoch ticker started");

        Ok(Some(EpochTicker {
            stop,
            handle: Some(handle),
        }))
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("epoch_interruption", &self.config.epoch_interruption)
            .field("epoch_tick_ms", &self.config.epoch_tick_ms)
            .finish_non_exhaustive()
    }
}

/// Handle to the epoch ticker thread.
pub struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    /// Stop the ticker and wait for its thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Epoch ticker thread panicked");
            }
        }
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for EpochTicker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochTicker")
            .field("running", &self.handle.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_creation_default() {
        let config = EngineConfig::default();
        let engine = WasmEngine::new(&config);

        assert!(engine.is_ok());
        let engine = engine.unwrap();
        assert!(!engine.is_pooling_enabled());
    }

    #[test]
    fn test_engine_creation_pooling() {
        let config = EngineConfig {
            pooling_allocator: true,
            max_instances: 4,
            instance_memory_mb: 1,
            ..Default::default()
        };
        let engine = WasmEngine::new(&config).unwrap();
        assert!(engine.is_pooling_enabled());
    }

    #[test]
    fn test_compile_rejects_garbage() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let result = engine.compile(b"definitely not wasm");
        assert!(matches!(
            result,
            Err(RuntimeError::CompilationFailed { .. })
        ));
    }

    #[test]
    fn test_epoch_ticks() {
        let engine = WasmEngine::new(&EngineConfig {
            epoch_tick_ms: 10,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(engine.epoch_ticks(100), 10);
        assert_eq!(engine.epoch_ticks(101), 11);
        assert_eq!(engine.epoch_ticks(0), 1);
    }

    #[test]
    fn test_epoch_ticker_lifecycle() {
        let engine = WasmEngine::new(&EngineConfig {
            epoch_tick_ms: 1,
            ..Default::default()
        })
        .unwrap();

        let ticker = engine.start_epoch_ticker().unwrap();
        assert!(ticker.is_some());
        ticker.unwrap().stop();

        let disabled = WasmEngine::new(&EngineConfig {
            epoch_interruption: false,
            ..Default::default()
        })
        .unwrap();
        assert!(disabled.start_epoch_ticker().unwrap().is_none());
    }

    #[test]
    fn test_engine_debug() {
        let config = EngineConfig::default();
        let engine = WasmEngine::new(&config).unwrap();

        let debug_str = format!("{engine:?}");
        assert!(debug_str.contains("WasmEngine"));
        assert!(debug_str.contains("pooling_allocator"));
    }
}
