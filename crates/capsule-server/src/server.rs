//! The capsule server.
//!
//! [`Server`] owns the engine, the host linker, and the module registry. It
//! is the only place process state lives: any number of tasks may share it
//! behind an `Arc` and call [`Server::execute`] concurrently.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use wasmtime::Linker;

use capsule_common::{RuntimeConfig, RuntimeError};
use capsule_core::{
    CallContext, CompiledModule, DrainOutcome, EpochTicker, GuestState, InstanceFactory,
    InstancePool, PoolStatus, WasmEngine,
};
use capsule_host::{Callback, build_linker};

use crate::registry::{ModuleConfig, ModuleEntry, ModuleRegistry, ModuleSource};

/// Configuration for [`Server::new`].
#[derive(Clone, Default)]
pub struct ServerConfig {
    /// Handler for every guest host call. Required.
    pub callback: Option<Arc<dyn Callback>>,
    /// Engine, execution, and pool settings.
    pub runtime: RuntimeConfig,
}

impl ServerConfig {
    /// Create a config with default runtime settings.
    pub fn new(callback: Arc<dyn Callback>) -> Self {
        Self {
            callback: Some(callback),
            runtime: RuntimeConfig::default(),
        }
    }

    /// Replace the runtime settings.
    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("callback", &self.callback.is_some())
            .field("runtime", &self.runtime)
            .finish()
    }
}

/// Module registry and execution server.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use capsule_core::CallContext;
/// use capsule_host::{CapabilityRouter, KvStoreCapability};
/// use capsule_server::{ModuleConfig, Server, ServerConfig};
///
/// let router = CapabilityRouter::new().with(KvStoreCapability::new());
/// let server = Server::new(ServerConfig::new(Arc::new(router)))?;
///
/// server.load_module(ModuleConfig::file("echo", "echo.wasm", 4)).await?;
/// let output = server.execute("echo", "run", b"hi", &CallContext::new()).await?;
///
/// server.shutdown().await;
/// ```
pub struct Server {
    engine: WasmEngine,
    linker: Arc<Linker<GuestState>>,
    runtime: RuntimeConfig,
    registry: ModuleRegistry,
    closed: AtomicBool,
    ticker: Mutex<Option<EpochTicker>>,
}

impl Server {
    /// Create a server with an empty registry.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::InvalidConfig`] if no callback is configured, or
    ///   the memory limit exceeds [`capsule_common::MAX_MEMORY_MB`]
    /// - Any error creating the engine or registering host imports
    pub fn new(config: ServerConfig) -> Result<Self, RuntimeError> {
        let ServerConfig { callback, runtime } = config;
        let callback =
            callback.ok_or_else(|| RuntimeError::invalid_config("a host callback is required"))?;
        runtime.execution.validate()?;

        let engine = WasmEngine::new(&runtime.engine)?;
        let linker = Arc::new(build_linker(&engine, callback, &runtime.execution)?);
        let ticker = engine.start_epoch_ticker()?;

        info!(
            pooling = engine.is_pooling_enabled(),
            epoch = ticker.is_some(),
            "Server created"
        );

        Ok(Self {
            engine,
            linker,
            runtime,
            registry: ModuleRegistry::new(),
            closed: AtomicBool::new(false),
            ticker: Mutex::new(ticker),
        })
    }

    /// The engine shared by every module.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    /// Runtime settings.
    pub fn runtime_config(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// Compile a module, fill its pool, and publish it.
    ///
    /// Nothing is visible in the registry until the pool is complete; a
    /// failed load leaves no trace.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::InvalidConfig`] for an empty name or zero pool size
    /// - [`RuntimeError::DuplicateModule`] if the name is taken
    /// - [`RuntimeError::Io`] if the source file cannot be read
    /// - [`RuntimeError::CompilationFailed`] for invalid bytecode
    /// - [`RuntimeError::InstantiationFailed`] if an instance cannot be built
    /// - [`RuntimeError::ServerClosed`] after [`Server::shutdown`]
    #[instrument(skip(self, config), fields(module = %config.name, pool_size = config.pool_size))]
    pub async fn load_module(&self, config: ModuleConfig) -> Result<(), RuntimeError> {
        self.ensure_open()?;
        config.validate()?;
        self.registry.check_available(&config.name)?;

        let compiled = self.compile(config.source).await?;
        let content_hash = compiled.content_hash().to_string();

        let factory = Arc::new(InstanceFactory::new(
            self.engine.clone(),
            Arc::clone(&self.linker),
            compiled,
            config.name.clone(),
            self.runtime.execution.clone(),
        ));
        let pool =
            InstancePool::new(factory, config.pool_size, self.runtime.pool.checkout_timeout())
                .await?;

        match self
            .registry
            .publish(ModuleEntry::new(config.name, content_hash, pool))
        {
            Ok(entry) => {
                info!(content_hash = %entry.content_hash(), "Module loaded");
                Ok(())
            }
            Err((entry, err)) => {
                entry.pool().drain(self.runtime.pool.drain_timeout()).await;
                Err(err)
            }
        }
    }

    async fn compile(&self, source: ModuleSource) -> Result<CompiledModule, RuntimeError> {
        let engine = self.engine.clone();
        let compiled = match source {
            ModuleSource::File(path) => {
                let bytes = tokio::fs::read(&path).await.inspect_err(|e| {
                    warn!(path = %path.display(), error = %e, "Failed to read module");
                })?;
                if path.extension().is_some_and(|ext| ext == "wat") {
                    let wat = String::from_utf8(bytes).map_err(|_| {
                        RuntimeError::invalid_config(format!(
                            "{} is not valid UTF-8",
                            path.display()
                        ))
                    })?;
                    tokio::task::spawn_blocking(move || engine.compile_wat(&wat)).await
                } else {
                    tokio::task::spawn_blocking(move || engine.compile(&bytes)).await
                }
            }
            ModuleSource::Bytes(bytes) => {
                tokio::task::spawn_blocking(move || engine.compile(&bytes)).await
            }
            ModuleSource::Wat(wat) => {
                tokio::task::spawn_blocking(move || engine.compile_wat(&wat)).await
            }
        };

        compiled.map_err(|e| RuntimeError::compilation_failed(format!("compile task failed: {e}")))?
    }

    /// Run `entrypoint` of module `name` with `payload`.
    ///
    /// Waits for an idle instance within the deadline of `ctx` (or the pool's
    /// checkout timeout). The instance always goes back to the pool, faulted
    /// first if the call trapped.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::ModuleNotFound`] if no module has that name
    /// - [`RuntimeError::ServerClosed`] after [`Server::shutdown`]
    /// - [`RuntimeError::Timeout`] / [`RuntimeError::Canceled`] while waiting
    ///   for an instance
    /// - Any error from the call itself (see [`capsule_core::Instance::call`])
    #[instrument(skip(self, payload, ctx), fields(request_id = %ctx.request_id(), payload_len = payload.len()))]
    pub async fn execute(
        &self,
        name: &str,
        entrypoint: &str,
        payload: &[u8],
        ctx: &CallContext,
    ) -> Result<Vec<u8>, RuntimeError> {
        self.ensure_open()?;
        let entry = self.registry.get(name)?;
        let ctx = ctx.scoped(name, entrypoint);

        let mut lease = entry
            .pool()
            .checkout(&ctx)
            .await
            .map_err(|e| self.closed_or(e))?;
        let result = lease.call(&ctx, entrypoint, payload).await;
        entry.pool().return_instance(lease).await;

        match &result {
            Ok(output) => debug!(output_len = output.len(), "Execution complete"),
            Err(e) => debug!(error = %e, "Execution failed"),
        }
        result
    }

    /// Remove a module and drain its pool.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ModuleNotFound`] if no module has that name.
    #[instrument(skip(self))]
    pub async fn unload_module(&self, name: &str) -> Result<DrainOutcome, RuntimeError> {
        let entry = self
            .registry
            .remove(name)
            .ok_or_else(|| RuntimeError::module_not_found(name))?;

        let outcome = entry.pool().drain(self.runtime.pool.drain_timeout()).await;
        info!(
            destroyed = outcome.destroyed,
            outstanding = outcome.outstanding,
            "Module unloaded"
        );
        Ok(outcome)
    }

    /// Stop accepting work, drain every pool, and stop the epoch ticker.
    ///
    /// Calling this more than once is a no-op.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("Shutdown already performed");
            return;
        }

        let entries = self.registry.close().unwrap_or_default();
        info!(modules = entries.len(), "Shutting down");

        // Pools drain side by side so shutdown takes one drain timeout overall.
        let timeout = self.runtime.pool.drain_timeout();
        let mut drains = JoinSet::new();
        for entry in entries {
            drains.spawn(async move {
                let outcome = entry.pool().drain(timeout).await;
                (entry, outcome)
            });
        }

        while let Some(joined) = drains.join_next().await {
            match joined {
                Ok((entry, outcome)) if outcome.outstanding > 0 => warn!(
                    module = %entry.name(),
                    outstanding = outcome.outstanding,
                    "Module drained with leases outstanding"
                ),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Drain task failed"),
            }
        }

        let ticker = self.ticker.lock().take();
        if let Some(ticker) = ticker {
            if let Err(e) = tokio::task::spawn_blocking(move || ticker.stop()).await {
                warn!(error = %e, "Epoch ticker did not stop cleanly");
            }
        }

        info!("Shutdown complete");
    }

    /// Names of the loaded modules, sorted.
    pub fn modules(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Pool status for a loaded module.
    pub fn module_status(&self, name: &str) -> Option<PoolStatus> {
        self.registry.get(name).ok().map(|entry| entry.status())
    }

    /// Returns `true` once [`Server::shutdown`] has started.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), RuntimeError> {
        if self.is_closed() {
            return Err(RuntimeError::ServerClosed);
        }
        Ok(())
    }

    /// A pool closed underneath a caller by shutdown reads as a closed server.
    fn closed_or(&self, err: RuntimeError) -> RuntimeError {
        match err {
            RuntimeError::PoolClosed { .. } if self.is_closed() => RuntimeError::ServerClosed,
            other => other,
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("modules", &self.registry.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_host::CapabilityRouter;

    fn server() -> Server {
        Server::new(ServerConfig::new(Arc::new(CapabilityRouter::new()))).unwrap()
    }

    #[test]
    fn test_callback_required() {
        let err = Server::new(ServerConfig::default()).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig { .. }));
    }

    #[test]
    fn test_memory_limit_beyond_pointer_range_rejected() {
        let mut runtime = RuntimeConfig::default();
        runtime.execution.max_memory_mb = capsule_common::MAX_MEMORY_MB * 2;
        let config = ServerConfig::new(Arc::new(CapabilityRouter::new())).with_runtime(runtime);

        let err = Server::new(config).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn test_new_server_is_empty() {
        let server = server();
        assert!(server.modules().is_empty());
        assert!(!server.is_closed());
        assert!(server.module_status("missing").is_none());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_bytecode() {
        let server = server();
        let err = server
            .load_module(ModuleConfig::bytes("junk", b"not wasm".to_vec(), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CompilationFailed { .. }));
        assert!(server.modules().is_empty());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_unload_missing() {
        let server = server();
        let err = server.unload_module("missing").await.unwrap_err();
        assert!(err.is_not_found());
        server.shutdown().await;
    }
}
