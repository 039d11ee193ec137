//! Integration tests for the host call bridge.
//!
//! A WAT guest relays its payload through `capsule::host_call` and returns
//! the packed result unchanged, so each test observes exactly what the
//! bridge handed back.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use capsule_common::{CallbackError, EngineConfig, ExecutionConfig, RuntimeError};
use capsule_core::{CallContext, Instance, InstanceFactory, WasmEngine};
use capsule_host::{Capability, CapabilityRouter, KvStoreCapability, build_linker};

const GUEST: &str = r#"
(module
  (import "capsule" "host_call"
    (func $host_call (param i32 i32 i32 i32 i32 i32 i32 i32) (result i64)))
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 1024))

  (data (i32.const 16) "test")
  (data (i32.const 32) "echo")
  (data (i32.const 40) "fail")
  (data (i32.const 48) "k")
  (data (i32.const 56) "nope")
  (data (i32.const 64) "empty")
  (data (i32.const 80) "\ff\fe")
  (data (i32.const 96) "kvstore")
  (data (i32.const 112) "set")
  (data (i32.const 120) "get")

  (func (export "allocate") (param $len i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $len)))
    (local.get $ptr))

  (func (export "reset")
    (global.set $heap (i32.const 1024)))

  (func (export "relay_echo") (param $p i32) (param $l i32) (result i64)
    (call $host_call (i32.const 16) (i32.const 4) (i32.const 32) (i32.const 4)
                     (i32.const 48) (i32.const 1) (local.get $p) (local.get $l)))

  (func (export "relay_fail") (param $p i32) (param $l i32) (result i64)
    (call $host_call (i32.const 16) (i32.const 4) (i32.const 40) (i32.const 4)
                     (i32.const 48) (i32.const 1) (local.get $p) (local.get $l)))

  (func (export "relay_unknown") (param $p i32) (param $l i32) (result i64)
    (call $host_call (i32.const 56) (i32.const 4) (i32.const 32) (i32.const 4)
                     (i32.const 48) (i32.const 1) (local.get $p) (local.get $l)))

  (func (export "relay_empty") (param $p i32) (param $l i32) (result i64)
    (call $host_call (i32.const 16) (i32.const 4) (i32.const 64) (i32.const 5)
                     (i32.const 48) (i32.const 1) (local.get $p) (local.get $l)))

  (func (export "relay_bad_utf8") (param $p i32) (param $l i32) (result i64)
    (call $host_call (i32.const 80) (i32.const 2) (i32.const 32) (i32.const 4)
                     (i32.const 48) (i32.const 1) (local.get $p) (local.get $l)))

  (func (export "kv_set") (param $p i32) (param $l i32) (result i64)
    (call $host_call (i32.const 96) (i32.const 7) (i32.const 112) (i32.const 3)
                     (i32.const 48) (i32.const 1) (local.get $p) (local.get $l)))

  (func (export "kv_get") (param $p i32) (param $l i32) (result i64)
    (call $host_call (i32.const 96) (i32.const 7) (i32.const 120) (i32.const 3)
                     (i32.const 48) (i32.const 1) (i32.const 0) (i32.const 0)))

  (func (export "probe_oob") (param i32 i32) (result i64)
    (i64.store (i32.const 0)
      (call $host_call (i32.const 16) (i32.const 4) (i32.const 32) (i32.const 4)
                       (i32.const 48) (i32.const 1) (i32.const 65530) (i32.const 100)))
    (i64.const 8))

  (func (export "probe_negative") (param i32 i32) (result i64)
    (i64.store (i32.const 0)
      (call $host_call (i32.const -1) (i32.const 4) (i32.const 32) (i32.const 4)
                       (i32.const 48) (i32.const 1) (i32.const 0) (i32.const 0)))
    (i64.const 8))
)
"#;

type Seen = Arc<Mutex<Vec<(String, String)>>>;

/// Test capability that records the request id and key of each call.
#[derive(Default)]
struct Probe {
    seen: Seen,
}

#[async_trait]
impl Capability for Probe {
    fn namespace(&self) -> &str {
        "test"
    }

    async fn call(
        &self,
        ctx: &CallContext,
        operation: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, CallbackError> {
        self.seen
            .lock()
            .unwrap()
            .push((ctx.request_id().to_string(), key.to_string()));

        match operation {
            "echo" => Ok(payload.to_vec()),
            "empty" => Ok(Vec::new()),
            "fail" => Err(CallbackError::failed("probe failure")),
            other => Err(CallbackError::UnknownOperation {
                namespace: "test".into(),
                operation: other.into(),
            }),
        }
    }
}

async fn instance() -> (Instance, Seen) {
    let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
    let probe = Probe::default();
    let seen = Arc::clone(&probe.seen);
    let router = CapabilityRouter::new()
        .with(probe)
        .with(KvStoreCapability::new());

    let config = ExecutionConfig {
        wasi: false,
        inherit_stdio: false,
        ..Default::default()
    };
    let linker = build_linker(&engine, Arc::new(router), &config).unwrap();
    let module = engine.compile_wat(GUEST).unwrap();
    let factory = InstanceFactory::new(engine, Arc::new(linker), module, "guest", config);

    (factory.instantiate().await.unwrap(), seen)
}

fn error_document(err: RuntimeError) -> serde_json::Value {
    match err {
        RuntimeError::ExecutionFailed {
            message,
            trap_code: None,
        } => serde_json::from_str(&message).unwrap(),
        other => panic!("expected a guest error document, got {other:?}"),
    }
}

#[tokio::test]
async fn test_echo_round_trip() {
    let (mut instance, seen) = instance().await;
    let ctx = CallContext::new().with_request_id("req-echo");

    let result = instance.call(&ctx, "relay_echo", b"round trip").await.unwrap();

    assert_eq!(result, b"round trip");
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &[("req-echo".to_string(), "k".to_string())]
    );
    assert_eq!(instance.guest().metrics.host_calls, 1);
}

#[tokio::test]
async fn test_large_payload_round_trip() {
    let (mut instance, _) = instance().await;
    let payload = vec![0xAB; 16 * 1024];

    let result = instance
        .call(&CallContext::new(), "relay_echo", &payload)
        .await
        .unwrap();
    assert_eq!(result, payload);
}

#[tokio::test]
async fn test_empty_result_is_zero() {
    let (mut instance, _) = instance().await;
    let result = instance
        .call(&CallContext::new(), "relay_empty", b"ignored")
        .await
        .unwrap();
    assert!(result.is_empty());
}

#[tokio::test]
async fn test_callback_error_document() {
    let (mut instance, _) = instance().await;
    let err = instance
        .call(&CallContext::new(), "relay_fail", b"")
        .await
        .unwrap_err();

    let document = error_document(err);
    assert_eq!(document["error"]["kind"], "failed");
    assert_eq!(document["namespace"], "test");
    assert_eq!(document["operation"], "fail");
    assert!(!instance.is_faulted());
}

#[tokio::test]
async fn test_unknown_namespace_document() {
    let (mut instance, _) = instance().await;
    let err = instance
        .call(&CallContext::new(), "relay_unknown", b"")
        .await
        .unwrap_err();

    let document = error_document(err);
    assert_eq!(document["error"]["kind"], "unknown_namespace");
    assert_eq!(document["namespace"], "nope");
}

#[tokio::test]
async fn test_invalid_utf8_namespace() {
    let (mut instance, seen) = instance().await;
    let err = instance
        .call(&CallContext::new(), "relay_bad_utf8", b"")
        .await
        .unwrap_err();

    let document = error_document(err);
    assert_eq!(document["error"]["kind"], "invalid_argument");
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_out_of_bounds_arguments_fail_only_the_call() {
    let (mut instance, seen) = instance().await;
    let ctx = CallContext::new();

    for probe_fn in ["probe_oob", "probe_negative"] {
        let result = instance.call(&ctx, probe_fn, b"").await.unwrap();
        let value = i64::from_le_bytes(result.try_into().unwrap());
        assert_eq!(value, capsule_core::abi::HOST_CALL_FAILED);
    }

    // The callback never ran and the instance is still usable.
    assert!(seen.lock().unwrap().is_empty());
    assert!(!instance.is_faulted());
    let result = instance.call(&ctx, "relay_echo", b"still alive").await.unwrap();
    assert_eq!(result, b"still alive");
}

#[tokio::test]
async fn test_kvstore_through_guest() {
    let (mut instance, _) = instance().await;
    let ctx = CallContext::new();

    instance.call(&ctx, "kv_set", b"stored").await.unwrap();
    let value = instance.call(&ctx, "kv_get", b"").await.unwrap();
    assert_eq!(value, b"stored");
}
