//! Core Wasmtime runtime for capsule.
//!
//! This crate provides the fundamental WebAssembly execution capabilities:
//! - [`WasmEngine`]: Configured Wasmtime engine shared by every module
//! - [`CompiledModule`]: Compiled WebAssembly module wrapper
//! - [`InstanceFactory`] and [`Instance`]: Long-lived instances called repeatedly
//! - [`InstancePool`]: Fixed-size pool of warm instances per module
//! - [`CallContext`]: Request id, deadline, and cancellation for one call
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WasmEngine                          │
//! │  (Shared by all modules, thread-safe)                   │
//! │  - Fuel metering, epoch interruption                    │
//! │  - Compilation settings                                 │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                   CompiledModule                        │
//! │  (One per loaded module, shared by its instances)       │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                   InstancePool                          │
//! │  N × Store<GuestState> + Instance                       │
//! │  - Checkout / return / replace on fault                 │
//! │  - Fuel and deadline re-armed per call                  │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod abi;
pub mod context;
pub mod engine;
pub mod instance;
pub mod memory;
pub mod module;
pub mod pool;
pub mod store;

pub use context::{CallContext, CancelHandle, Interrupted};
pub use engine::{EpochTicker, WasmEngine};
pub use instance::{Instance, InstanceFactory, InstanceState};
pub use module::CompiledModule;
pub use pool::{DrainOutcome, InstancePool, PoolStatus, PooledInstance};
pub use store::{GuestState, InstanceMetrics};
