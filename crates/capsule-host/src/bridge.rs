//! Host function registration for Wasmtime linkers.
//!
//! This module wires guest imports to the host:
//! - `capsule::host_call`, routed to the server's [`Callback`]
//! - WASI preview 1, for guests built against `wasm32-wasip1`
//!
//! # Memory Protocol
//!
//! `host_call(ns_ptr, ns_len, op_ptr, op_len, key_ptr, key_len, payload_ptr, payload_len) -> i64`
//!
//! Every `(ptr, len)` pair is bounds-checked before anything is read. The
//! callback's result is copied into memory obtained from the guest
//! allocator and returned packed as described in [`capsule_core::abi`].
//! Callback failures are returned as a JSON error document so the guest can
//! inspect them; a failure that leaves nothing to report returns
//! [`abi::HOST_CALL_FAILED`].

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};
use wasmtime::{Caller, Extern, Linker, Memory, TypedFunc};

use crate::Callback;
use capsule_common::{CallbackError, ExecutionConfig, RuntimeError};
use capsule_core::abi;
use capsule_core::memory;
use capsule_core::{CallContext, GuestState, Interrupted, WasmEngine};

type HostCallArgs = (i32, i32, i32, i32, i32, i32, i32, i32);

/// Build a linker carrying every host import.
///
/// # Errors
///
/// Returns an error if registration fails.
pub fn build_linker(
    engine: &WasmEngine,
    callback: Arc<dyn Callback>,
    config: &ExecutionConfig,
) -> Result<Linker<GuestState>, RuntimeError> {
    let mut linker = Linker::new(engine.inner());
    register(&mut linker, callback, config)?;
    Ok(linker)
}

/// Register all host imports on a linker.
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn register(
    linker: &mut Linker<GuestState>,
    callback: Arc<dyn Callback>,
    config: &ExecutionConfig,
) -> Result<(), RuntimeError> {
    if config.wasi {
        wasmtime_wasi::preview1::add_to_linker_async(linker, GuestState::wasi_mut).map_err(
            |e| RuntimeError::invalid_config(format!("Failed to register WASI imports: {e}")),
        )?;
    }
    register_host_call(linker, callback, &config.allocate_export)
}

/// Register `capsule::host_call`.
pub fn register_host_call(
    linker: &mut Linker<GuestState>,
    callback: Arc<dyn Callback>,
    allocate_export: &str,
) -> Result<(), RuntimeError> {
    let allocate_export: Arc<str> = Arc::from(allocate_export);

    linker
        .func_wrap_async(
            abi::IMPORT_MODULE,
            abi::HOST_CALL,
            move |mut caller: Caller<'_, GuestState>, args: HostCallArgs| {
                let callback = Arc::clone(&callback);
                let allocate_export = Arc::clone(&allocate_export);
                Box::new(async move {
                    host_call(&mut caller, callback.as_ref(), &allocate_export, args).await
                })
            },
        )
        .map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to register host_call: {e}"))
        })?;

    Ok(())
}

/// Arguments of one host call, copied out of guest memory.
struct HostRequest {
    namespace: String,
    operation: String,
    key: String,
    payload: Vec<u8>,
}

#[derive(Serialize)]
struct ErrorDocument<'a> {
    error: ErrorBody<'a>,
    namespace: &'a str,
    operation: &'a str,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    kind: &'a str,
    message: String,
}

async fn host_call(
    caller: &mut Caller<'_, GuestState>,
    callback: &dyn Callback,
    allocate_export: &str,
    args: HostCallArgs,
) -> i64 {
    caller.data_mut().record_host_call();

    let Some(memory) = caller.get_export("memory").and_then(Extern::into_memory) else {
        warn!("Host call from a guest without an exported memory");
        return abi::HOST_CALL_FAILED;
    };

    let request = match read_request(&memory, &*caller, args) {
        Ok(request) => request,
        Err(RuntimeError::Callback(err)) => {
            let document = error_document("", "", &err);
            return write_error(caller, &memory, allocate_export, &document).await;
        }
        Err(err) => {
            warn!(error = %err, "Rejected host call arguments");
            return abi::HOST_CALL_FAILED;
        }
    };

    let ctx = caller.data().call().cloned().unwrap_or_else(|| {
        CallContext::new().scoped(caller.data().module(), abi::INITIALIZE_EXPORT)
    });

    let start = Instant::now();
    let guarded = ctx
        .guard(callback.call(
            &ctx,
            &request.namespace,
            &request.operation,
            &request.key,
            &request.payload,
        ))
        .await;
    let outcome = guarded.unwrap_or_else(|interrupted| {
        Err(CallbackError::failed(match interrupted {
            Interrupted::Canceled => "request canceled",
            Interrupted::DeadlineExceeded => "deadline exceeded",
        }))
    });

    debug!(
        request_id = %ctx.request_id(),
        namespace = %request.namespace,
        operation = %request.operation,
        duration_ms = start.elapsed().as_millis(),
        ok = outcome.is_ok(),
        "Host call completed"
    );

    match outcome {
        Ok(bytes) => write_result(caller, &memory, allocate_export, &bytes).await,
        Err(err) => {
            let document = error_document(&request.namespace, &request.operation, &err);
            write_error(caller, &memory, allocate_export, &document).await
        }
    }
}

fn read_request(
    memory: &Memory,
    caller: &Caller<'_, GuestState>,
    (ns_ptr, ns_len, op_ptr, op_len, key_ptr, key_len, payload_ptr, payload_len): HostCallArgs,
) -> Result<HostRequest, RuntimeError> {
    // Check every region before copying any of them.
    let size = memory.data_size(caller);
    for (ptr, len) in [
        (ns_ptr, ns_len),
        (op_ptr, op_len),
        (key_ptr, key_len),
        (payload_ptr, payload_len),
    ] {
        memory::checked_range(ptr, len, size)?;
    }

    Ok(HostRequest {
        namespace: memory::read_string(memory, caller, ns_ptr, ns_len)?,
        operation: memory::read_string(memory, caller, op_ptr, op_len)?,
        key: memory::read_string(memory, caller, key_ptr, key_len)?,
        payload: memory::read_bytes(memory, caller, payload_ptr, payload_len)?,
    })
}

/// The document delivered to the guest when a host call fails.
///
/// A handler-supplied response document takes precedence over the generic one.
pub fn error_document(namespace: &str, operation: &str, err: &CallbackError) -> Vec<u8> {
    if let Some(payload) = err.payload() {
        return payload.to_vec();
    }

    let document = ErrorDocument {
        error: ErrorBody {
            kind: err.kind(),
            message: err.to_string(),
        },
        namespace,
        operation,
    };
    serde_json::to_vec(&document).unwrap_or_default()
}

fn allocator(
    caller: &mut Caller<'_, GuestState>,
    allocate_export: &str,
) -> Option<TypedFunc<i32, i32>> {
    caller
        .get_export(allocate_export)
        .and_then(Extern::into_func)
        .and_then(|func| func.typed::<i32, i32>(&*caller).ok())
}

async fn copy_in(
    caller: &mut Caller<'_, GuestState>,
    memory: &Memory,
    allocate_export: &str,
    bytes: &[u8],
) -> Option<u32> {
    let Some(allocate) = allocator(caller, allocate_export) else {
        warn!(export = allocate_export, "Guest allocator missing");
        return None;
    };

    match memory::write_allocated(memory, &mut *caller, &allocate, bytes).await {
        Ok(ptr) => Some(ptr),
        Err(e) => {
            // The allocator may have trapped halfway; the guest heap is suspect.
            warn!(error = %e, "Copying host call result into guest failed");
            caller
                .data_mut()
                .poison(format!("host call result copy failed: {e}"));
            None
        }
    }
}

async fn write_result(
    caller: &mut Caller<'_, GuestState>,
    memory: &Memory,
    allocate_export: &str,
    bytes: &[u8],
) -> i64 {
    let Some(ptr) = copy_in(caller, memory, allocate_export, bytes).await else {
        return abi::HOST_CALL_FAILED;
    };

    // copy_in only succeeds for lengths that fit in i32.
    #[allow(clippy::cast_possible_truncation)]
    let len = bytes.len() as u32;
    abi::pack(ptr, len).unwrap_or(abi::HOST_CALL_FAILED)
}

async fn write_error(
    caller: &mut Caller<'_, GuestState>,
    memory: &Memory,
    allocate_export: &str,
    document: &[u8],
) -> i64 {
    if document.is_empty() {
        return abi::HOST_CALL_FAILED;
    }
    let Some(ptr) = copy_in(caller, memory, allocate_export, document).await else {
        return abi::HOST_CALL_FAILED;
    };

    #[allow(clippy::cast_possible_truncation)]
    let len = document.len() as u32;
    abi::pack_error(ptr, len)
}
