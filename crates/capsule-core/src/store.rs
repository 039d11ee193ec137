//! Per-instance store state.
//!
//! This module provides:
//! - [`GuestState`]: Data owned by each instance's [`Store`], reachable from host functions
//! - [`InstanceMetrics`]: Counters accumulated across the instance's lifetime
//! - [`create_store`]: Store construction with fuel, epoch, and memory limits applied

use std::time::Duration;

use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::{CallContext, WasmEngine};
use capsule_common::{ExecutionConfig, RuntimeError};

/// State owned by a single instance's store.
///
/// Unlike per-request state, a `GuestState` lives as long as its instance
/// and is reused across calls. The current call's [`CallContext`] is
/// attached for the duration of each call so host functions can see it.
pub struct GuestState {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
    module: String,
    call: Option<CallContext>,
    poisoned: Option<String>,

    /// Lifetime counters.
    pub metrics: InstanceMetrics,
}

/// Counters accumulated across an instance's lifetime.
#[derive(Debug, Clone, Default)]
pub struct InstanceMetrics {
    /// Completed entrypoint calls, successful or not.
    pub calls: u64,

    /// Host calls made by the guest.
    pub host_calls: u64,

    /// Fuel consumed by the most recent call.
    pub last_fuel_consumed: u64,

    /// Duration of the most recent call.
    pub last_duration: Option<Duration>,
}

impl GuestState {
    /// Create state for an instance of `module`.
    pub fn new(module: impl Into<String>, config: &ExecutionConfig) -> Self {
        let mut builder = WasiCtxBuilder::new();
        if config.inherit_stdio {
            builder.inherit_stdout().inherit_stderr();
        }

        let limits = StoreLimitsBuilder::new()
            .memory_size(config.max_memory_bytes())
            .instances(1)
            .build();

        Self {
            wasi: builder.build_p1(),
            limits,
            module: module.into(),
            call: None,
            poisoned: None,
            metrics: InstanceMetrics::default(),
        }
    }

    /// WASI preview 1 context.
    pub fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }

    /// Name of the module this instance belongs to.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Context of the call in progress, if any.
    pub fn call(&self) -> Option<&CallContext> {
        self.call.as_ref()
    }

    pub(crate) fn begin_call(&mut self, ctx: CallContext) {
        self.call = Some(ctx);
    }

    pub(crate) fn end_call(&mut self, fuel_consumed: u64, duration: Duration) {
        self.call = None;
        self.metrics.calls += 1;
        self.metrics.last_fuel_consumed = fuel_consumed;
        self.metrics.last_duration = Some(duration);
    }

    /// Record a host call.
    pub fn record_host_call(&mut self) {
        self.metrics.host_calls += 1;
    }

    /// Mark the instance unusable after the current call.
    ///
    /// Host functions use this when they leave guest memory in an unknown
    /// state, e.g. when the guest allocator traps mid-call.
    pub fn poison(&mut self, reason: impl Into<String>) {
        if self.poisoned.is_none() {
            self.poisoned = Some(reason.into());
        }
    }

    /// Why the instance was poisoned, if it was.
    pub fn poisoned(&self) -> Option<&str> {
        self.poisoned.as_deref()
    }
}

impl std::fmt::Debug for GuestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestState")
            .field("module", &self.module)
            .field("poisoned", &self.poisoned)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

/// Create a store for one instance of `module`.
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn create_store(
    engine: &WasmEngine,
    config: &ExecutionConfig,
    module: &str,
) -> Result<Store<GuestState>, RuntimeError> {
    let mut store = Store::new(engine.inner(), GuestState::new(module, config));
    store.limiter(|state| &mut state.limits);

    refuel(&mut store, config)?;
    arm_deadline(&mut store, engine, config.timeout_ms);

    Ok(store)
}

/// Reset the store's fuel to the configured budget.
///
/// The engine always consumes fuel; with metering disabled the budget is
/// effectively unlimited.
pub fn refuel(store: &mut Store<GuestState>, config: &ExecutionConfig) -> Result<(), RuntimeError> {
    let fuel = if config.fuel_metering {
        config.max_fuel
    } else {
        u64::MAX
    };
    store
        .set_fuel(fuel)
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))
}

/// Set the epoch deadline to `timeout_ms` from now.
pub fn arm_deadline(store: &mut Store<GuestState>, engine: &WasmEngine, timeout_ms: u64) {
    if engine.config().epoch_interruption {
        store.set_epoch_deadline(engine.epoch_ticks(timeout_ms));
    }
}

/// Fuel left in a store.
pub fn remaining_fuel(store: &Store<GuestState>) -> u64 {
    store.get_fuel().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_common::EngineConfig;

    #[test]
    fn test_guest_state_creation() {
        let state = GuestState::new("echo", &ExecutionConfig::default());

        assert_eq!(state.module(), "echo");
        assert!(state.call().is_none());
        assert!(state.poisoned().is_none());
        assert_eq!(state.metrics.calls, 0);
    }

    #[test]
    fn test_call_bookkeeping() {
        let mut state = GuestState::new("echo", &ExecutionConfig::default());

        state.begin_call(CallContext::new().with_request_id("r1"));
        assert_eq!(state.call().map(CallContext::request_id), Some("r1"));

        state.record_host_call();
        state.end_call(500, Duration::from_millis(3));

        assert!(state.call().is_none());
        assert_eq!(state.metrics.calls, 1);
        assert_eq!(state.metrics.host_calls, 1);
        assert_eq!(state.metrics.last_fuel_consumed, 500);
    }

    #[test]
    fn test_poison_keeps_first_reason() {
        let mut state = GuestState::new("echo", &ExecutionConfig::default());
        state.poison("allocator trapped");
        state.poison("second");
        assert_eq!(state.poisoned(), Some("allocator trapped"));
    }

    #[test]
    fn test_store_fuel() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let config = ExecutionConfig {
            max_fuel: 1000,
            fuel_metering: true,
            ..Default::default()
        };

        let store = create_store(&engine, &config, "test").unwrap();
        assert_eq!(remaining_fuel(&store), 1000);
    }

    #[test]
    fn test_store_fuel_unmetered() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let config = ExecutionConfig {
            fuel_metering: false,
            ..Default::default()
        };

        let store = create_store(&engine, &config, "test").unwrap();
        assert_eq!(remaining_fuel(&store), u64::MAX);
    }
}
