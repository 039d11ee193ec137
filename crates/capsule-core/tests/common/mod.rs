//! Shared guest fixtures for core integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use wasmtime::Linker;

use capsule_common::{EngineConfig, ExecutionConfig};
use capsule_core::{GuestState, InstanceFactory, WasmEngine};

/// A guest with a bump allocator and one entrypoint per behavior under test.
///
/// - `echo`: returns its input
/// - `heap`: returns the allocator's next free address as 4 LE bytes
/// - `empty`: returns an empty result
/// - `fail`: reports an error document `{"error":"bad"}`
/// - `fail_bare`: reports failure without a document
/// - `oob`: returns a result outside linear memory
/// - `trap`: hits `unreachable`
/// - `spin`: loops forever
pub const GUEST: &str = r#"
(module
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 1024))

  (data (i32.const 16) "{\"error\":\"bad\"}")

  (func (export "allocate") (param $len i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $len)))
    (local.get $ptr))

  (func (export "reset")
    (global.set $heap (i32.const 1024)))

  (func (export "echo") (param $ptr i32) (param $len i32) (result i64)
    (i64.or
      (i64.shl (i64.extend_i32_u (local.get $ptr)) (i64.const 32))
      (i64.extend_i32_u (local.get $len))))

  (func (export "heap") (param i32 i32) (result i64)
    (i32.store (i32.const 0) (global.get $heap))
    (i64.const 4))

  (func (export "empty") (param i32 i32) (result i64)
    (i64.const 0))

  (func (export "fail") (param i32 i32) (result i64)
    (i64.or
      (i64.const -9223372036854775808)
      (i64.or (i64.shl (i64.const 16) (i64.const 32)) (i64.const 15))))

  (func (export "fail_bare") (param i32 i32) (result i64)
    (i64.const -1))

  (func (export "oob") (param i32 i32) (result i64)
    (i64.or (i64.shl (i64.const 65530) (i64.const 32)) (i64.const 100)))

  (func (export "trap") (param i32 i32) (result i64)
    unreachable)

  (func (export "spin") (param i32 i32) (result i64)
    (loop $forever (br $forever))
    (i64.const 0))
)
"#;

/// A guest whose `_initialize` asks the host for admission first.
pub const ADMITTED_GUEST: &str = r#"
(module
  (import "env" "admit" (func $admit))
  (memory (export "memory") 1)

  (func (export "allocate") (param i32) (result i32)
    (i32.const 1024))

  (func (export "_initialize")
    (call $admit))

  (func (export "echo") (param $ptr i32) (param $len i32) (result i64)
    (i64.or
      (i64.shl (i64.extend_i32_u (local.get $ptr)) (i64.const 32))
      (i64.extend_i32_u (local.get $len))))

  (func (export "trap") (param i32 i32) (result i64)
    unreachable)
)
"#;

pub fn engine() -> WasmEngine {
    WasmEngine::new(&EngineConfig {
        epoch_tick_ms: 5,
        ..Default::default()
    })
    .unwrap()
}

/// Engine backed by the pooling allocator with room for `max_instances`.
pub fn pooling_engine(max_instances: u32) -> WasmEngine {
    WasmEngine::new(&EngineConfig {
        pooling_allocator: true,
        max_instances,
        instance_memory_mb: 1,
        epoch_tick_ms: 5,
        ..Default::default()
    })
    .unwrap()
}

pub fn factory_with(engine: &WasmEngine, wat: &str, config: ExecutionConfig) -> Arc<InstanceFactory> {
    let module = engine.compile_wat(wat).unwrap();
    let linker = Arc::new(Linker::<GuestState>::new(engine.inner()));
    Arc::new(InstanceFactory::new(
        engine.clone(),
        linker,
        module,
        "guest",
        config,
    ))
}

pub fn factory(engine: &WasmEngine) -> Arc<InstanceFactory> {
    factory_with(
        engine,
        GUEST,
        ExecutionConfig {
            wasi: false,
            inherit_stdio: false,
            ..Default::default()
        },
    )
}

/// Factory for [`ADMITTED_GUEST`] whose instantiations fail after the
/// first `admitted` succeed.
pub fn admitted_factory(engine: &WasmEngine, admitted: usize) -> Arc<InstanceFactory> {
    let module = engine.compile_wat(ADMITTED_GUEST).unwrap();
    let mut linker = Linker::<GuestState>::new(engine.inner());
    let count = Arc::new(AtomicUsize::new(0));
    linker
        .func_wrap("env", "admit", move || -> wasmtime::Result<()> {
            if count.fetch_add(1, Ordering::SeqCst) < admitted {
                Ok(())
            } else {
                Err(wasmtime::Error::msg("no more instances admitted"))
            }
        })
        .unwrap();
    Arc::new(InstanceFactory::new(
        engine.clone(),
        Arc::new(linker),
        module,
        "admitted",
        ExecutionConfig {
            wasi: false,
            inherit_stdio: false,
            ..Default::default()
        },
    ))
}
