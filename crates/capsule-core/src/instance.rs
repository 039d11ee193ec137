//! WebAssembly instance lifecycle management.
//!
//! This module provides:
//! - [`InstanceFactory`]: Creates ready-to-call instances of one compiled module
//! - [`Instance`]: A live instance with its own store, called repeatedly
//!
//! An instance's life:
//!
//! 1. Instantiate against the shared linker, run `_initialize` if exported
//! 2. Per call: write the payload through the guest allocator, call the
//!    entrypoint, decode the packed result
//! 3. Between calls: refuel and run the guest's `reset` export if present
//! 4. Any trap faults the instance; faulted instances are never reused

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::{debug, instrument, warn};
use wasmtime::{Linker, Memory, Store, Trap, TypedFunc};

use crate::abi::{self, Packed};
use crate::memory;
use crate::store::{GuestState, arm_deadline, create_store, refuel, remaining_fuel};
use crate::{CallContext, CompiledModule, Interrupted, WasmEngine};
use capsule_common::{ExecutionConfig, RuntimeError};

/// Lifecycle state of an [`Instance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Waiting in a pool.
    Idle,
    /// Checked out by a caller.
    Leased,
    /// Trapped or otherwise left in an unknown state. Must be destroyed.
    Faulted,
}

/// Creates instances of a single compiled module.
pub struct InstanceFactory {
    engine: WasmEngine,
    linker: Arc<Linker<GuestState>>,
    module: CompiledModule,
    module_name: String,
    config: ExecutionConfig,
    next_id: AtomicU64,
}

impl InstanceFactory {
    /// Create a factory.
    ///
    /// `linker` must already carry every import the module needs.
    pub fn new(
        engine: WasmEngine,
        linker: Arc<Linker<GuestState>>,
        module: CompiledModule,
        module_name: impl Into<String>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            engine,
            linker,
            module,
            module_name: module_name.into(),
            config,
            next_id: AtomicU64::new(1),
        }
    }

    /// Name of the module this factory instantiates.
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// The compiled module.
    pub fn module(&self) -> &CompiledModule {
        &self.module
    }

    /// Create a new idle instance.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InstantiationFailed`] if:
    /// - An import cannot be satisfied
    /// - `memory` or the allocator export is missing or mistyped
    /// - `_initialize` traps
    #[instrument(skip(self), fields(module = %self.module_name))]
    pub async fn instantiate(&self) -> Result<Instance, RuntimeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut store = create_store(&self.engine, &self.config, &self.module_name)?;

        let instance = self
            .linker
            .instantiate_async(&mut store, self.module.inner())
            .await
            .map_err(|e| RuntimeError::instantiation_failed(format!("{e:#}")))?;

        let memory = instance.get_memory(&mut store, "memory").ok_or_else(|| {
            RuntimeError::instantiation_failed("module does not export `memory`")
        })?;

        let allocate = instance
            .get_typed_func::<i32, i32>(&mut store, &self.config.allocate_export)
            .map_err(|e| {
                RuntimeError::instantiation_failed(format!(
                    "allocator export `{}` unusable: {e}",
                    self.config.allocate_export
                ))
            })?;

        let reset = match instance.get_func(&mut store, abi::RESET_EXPORT) {
            Some(func) => Some(func.typed::<(), ()>(&store).map_err(|e| {
                RuntimeError::instantiation_failed(format!("`reset` export unusable: {e}"))
            })?),
            None => None,
        };

        if let Some(init) = instance.get_func(&mut store, abi::INITIALIZE_EXPORT) {
            let init = init.typed::<(), ()>(&store).map_err(|e| {
                RuntimeError::instantiation_failed(format!("`_initialize` export unusable: {e}"))
            })?;
            init.call_async(&mut store, ()).await.map_err(|e| {
                RuntimeError::instantiation_failed(format!("`_initialize` failed: {e:#}"))
            })?;
            refuel(&mut store, &self.config)?;
        }

        debug!(instance_id = id, "Instance created");

        Ok(Instance {
            id,
            engine: self.engine.clone(),
            config: self.config.clone(),
            store,
            instance,
            memory,
            allocate,
            reset,
            state: InstanceState::Idle,
        })
    }
}

impl std::fmt::Debug for InstanceFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceFactory")
            .field("module_name", &self.module_name)
            .finish_non_exhaustive()
    }
}

/// A live instance of a module.
///
/// An instance is exclusively owned by whoever holds it; calls never run
/// concurrently on the same store.
pub struct Instance {
    id: u64,
    engine: WasmEngine,
    config: ExecutionConfig,
    store: Store<GuestState>,
    instance: wasmtime::Instance,
    memory: Memory,
    allocate: TypedFunc<i32, i32>,
    reset: Option<TypedFunc<(), ()>>,
    state: InstanceState,
}

impl Instance {
    /// Instance identifier, unique within its factory.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Returns `true` if the instance must not be reused.
    pub fn is_faulted(&self) -> bool {
        self.state == InstanceState::Faulted
    }

    /// Store state, including lifetime metrics.
    pub fn guest(&self) -> &GuestState {
        self.store.data()
    }

    /// Current size of the instance's linear memory in bytes.
    pub fn memory_size(&self) -> usize {
        self.memory.data_size(&self.store)
    }

    pub(crate) fn set_state(&mut self, state: InstanceState) {
        if self.state != InstanceState::Faulted {
            self.state = state;
        }
    }

    /// Call `entrypoint` with `payload` and return the guest's result bytes.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::EntrypointNotFound`] if the export is missing or not `(i32, i32) -> i64`
    /// - [`RuntimeError::ExecutionFailed`] if the guest traps or reports an error
    /// - [`RuntimeError::FuelExhausted`] or [`RuntimeError::ExecutionTimeout`] on resource limits
    /// - [`RuntimeError::Canceled`] if `ctx` is cancelled mid-call
    /// - [`RuntimeError::MemoryFault`] if the guest returns an out-of-bounds result
    ///
    /// Every error except a missing entrypoint or a guest-reported error
    /// leaves the instance faulted.
    #[instrument(skip(self, ctx, payload), fields(instance_id = self.id, request_id = %ctx.request_id(), payload_len = payload.len()))]
    pub async fn call(
        &mut self,
        ctx: &CallContext,
        entrypoint: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, RuntimeError> {
        if self.is_faulted() {
            return Err(RuntimeError::execution("instance is faulted"));
        }

        let func = self
            .instance
            .get_typed_func::<(i32, i32), i64>(&mut self.store, entrypoint)
            .map_err(|_| RuntimeError::EntrypointNotFound {
                entrypoint: entrypoint.to_string(),
            })?;

        let timeout_ms = effective_timeout_ms(ctx, self.config.timeout_ms);
        arm_deadline(&mut self.store, &self.engine, timeout_ms);
        self.store.data_mut().begin_call(ctx.clone());

        let start = Instant::now();
        let fuel_before = remaining_fuel(&self.store);

        let guarded = ctx.guard(self.invoke(&func, payload, timeout_ms)).await;
        let outcome = match guarded {
            Ok(Ok(packed)) => self.decode(packed),
            Ok(Err(e)) => {
                self.state = InstanceState::Faulted;
                Err(e)
            }
            Err(interrupted) => {
                // The guest was stopped mid-call; its memory is in an unknown state.
                self.state = InstanceState::Faulted;
                Err(match interrupted {
                    Interrupted::Canceled => RuntimeError::Canceled,
                    Interrupted::DeadlineExceeded => RuntimeError::ExecutionTimeout {
                        duration_ms: timeout_ms,
                    },
                })
            }
        };

        if matches!(outcome, Err(RuntimeError::MemoryFault { .. })) {
            self.state = InstanceState::Faulted;
        }
        if let Some(reason) = self.store.data().poisoned() {
            warn!(reason, "Instance poisoned by host call");
            self.state = InstanceState::Faulted;
        }

        let fuel_consumed = fuel_before.saturating_sub(remaining_fuel(&self.store));
        let duration = start.elapsed();
        self.store.data_mut().end_call(fuel_consumed, duration);

        match &outcome {
            Ok(result) => debug!(
                duration_ms = duration.as_millis(),
                fuel_consumed,
                result_len = result.len(),
                "Call completed"
            ),
            Err(e) => warn!(
                duration_ms = duration.as_millis(),
                fuel_consumed,
                faulted = self.is_faulted(),
                error = %e,
                "Call failed"
            ),
        }

        outcome
    }

    async fn invoke(
        &mut self,
        func: &TypedFunc<(i32, i32), i64>,
        payload: &[u8],
        timeout_ms: u64,
    ) -> Result<i64, RuntimeError> {
        let ptr =
            memory::write_allocated(&self.memory, &mut self.store, &self.allocate, payload).await?;

        // write_allocated rejects payloads that do not fit in i32.
        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        let args = (ptr as i32, payload.len() as i32);

        func.call_async(&mut self.store, args)
            .await
            .map_err(|e| classify_trap(&e, timeout_ms))
    }

    fn decode(&self, packed: i64) -> Result<Vec<u8>, RuntimeError> {
        match abi::unpack(packed) {
            Packed::Ok { len: 0, .. } => Ok(Vec::new()),
            Packed::Ok { ptr, len } => memory::read_region(&self.memory, &self.store, ptr, len),
            Packed::Err { ptr, len } => {
                let document = memory::read_region(&self.memory, &self.store, ptr, len)?;
                Err(RuntimeError::execution(
                    String::from_utf8_lossy(&document).into_owned(),
                ))
            }
            Packed::Failed => Err(RuntimeError::execution(
                "guest reported failure without an error document",
            )),
        }
    }

    /// Prepare the instance for its next call.
    ///
    /// Restores the fuel budget and runs the guest's `reset` export if it
    /// has one.
    ///
    /// # Errors
    ///
    /// Returns an error, and faults the instance, if the instance is already
    /// faulted or `reset` traps.
    pub async fn reset(&mut self) -> Result<(), RuntimeError> {
        if self.is_faulted() {
            return Err(RuntimeError::execution("instance is faulted"));
        }

        if let Err(e) = self.try_reset().await {
            self.state = InstanceState::Faulted;
            return Err(e);
        }
        Ok(())
    }

    async fn try_reset(&mut self) -> Result<(), RuntimeError> {
        let size = self.memory_size();
        if size > self.config.max_memory_bytes() {
            return Err(RuntimeError::memory_fault(format!(
                "memory grew to {size} bytes, limit is {}",
                self.config.max_memory_bytes()
            )));
        }

        refuel(&mut self.store, &self.config)?;

        if let Some(reset) = &self.reset {
            arm_deadline(&mut self.store, &self.engine, self.config.timeout_ms);
            reset
                .call_async(&mut self.store, ())
                .await
                .map_err(|e| classify_trap(&e, self.config.timeout_ms))?;
            refuel(&mut self.store, &self.config)?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("module", &self.store.data().module())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn effective_timeout_ms(ctx: &CallContext, configured_ms: u64) -> u64 {
    match ctx.remaining() {
        Some(remaining) => {
            let remaining_ms = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX);
            remaining_ms.min(configured_ms)
        }
        None => configured_ms,
    }
}

/// Map a Wasmtime error from guest code to a runtime error.
pub(crate) fn classify_trap(error: &wasmtime::Error, timeout_ms: u64) -> RuntimeError {
    match error.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => RuntimeError::FuelExhausted,
        Some(Trap::Interrupt) => RuntimeError::ExecutionTimeout {
            duration_ms: timeout_ms,
        },
        Some(trap) => RuntimeError::ExecutionFailed {
            message: error.to_string(),
            trap_code: Some(format!("{trap:?}")),
        },
        None => RuntimeError::ExecutionFailed {
            message: format!("{error:#}"),
            trap_code: None,
        },
    }
}

/// Trap code of a Wasmtime error, if it is a trap.
pub(crate) fn trap_code(error: &wasmtime::Error) -> Option<String> {
    error.downcast_ref::<Trap>().map(|trap| format!("{trap:?}"))
}
