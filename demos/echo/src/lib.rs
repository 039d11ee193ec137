//! Minimal capsule guest.
//!
//! Build with `cargo build --release --target wasm32-unknown-unknown` and
//! load the resulting `.wasm` as a module. Entrypoints:
//!
//! - `echo`: returns its input
//! - `log_echo`: logs its input through the `logger` capability, then
//!   returns it
//! - `remember`: stores its input under key `last` in the `kvstore`
//!   capability and returns what was stored there before

#![no_std]

use core::panic::PanicInfo;

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    core::arch::wasm32::unreachable()
}

#[link(wasm_import_module = "capsule")]
extern "C" {
    fn host_call(
        namespace_ptr: *const u8,
        namespace_len: usize,
        operation_ptr: *const u8,
        operation_len: usize,
        key_ptr: *const u8,
        key_len: usize,
        payload_ptr: *const u8,
        payload_len: usize,
    ) -> i64;
}

const HEAP_SIZE: usize = 256 * 1024;
const ERROR_FLAG: i64 = i64::MIN;

static mut HEAP: [u8; HEAP_SIZE] = [0; HEAP_SIZE];
static mut NEXT: usize = 0;

/// Bump allocator; the host calls `reset` after every call.
#[no_mangle]
pub extern "C" fn allocate(len: usize) -> *mut u8 {
    unsafe {
        let start = NEXT;
        let end = match start.checked_add(len) {
            Some(end) if end <= HEAP_SIZE => end,
            _ => return core::ptr::null_mut(),
        };
        NEXT = end;
        core::ptr::addr_of_mut!(HEAP).cast::<u8>().add(start)
    }
}

#[no_mangle]
pub extern "C" fn reset() {
    unsafe { NEXT = 0 }
}

fn pack(ptr: *const u8, len: usize) -> i64 {
    ((ptr as usize as i64) << 32) | len as i64
}

fn call(namespace: &str, operation: &str, key: &str, payload: &[u8]) -> Result<(u32, u32), ()> {
    let packed = unsafe {
        host_call(
            namespace.as_ptr(),
            namespace.len(),
            operation.as_ptr(),
            operation.len(),
            key.as_ptr(),
            key.len(),
            payload.as_ptr(),
            payload.len(),
        )
    };
    if packed == -1 || packed & ERROR_FLAG != 0 {
        return Err(());
    }
    Ok(((packed >> 32) as u32, packed as u32))
}

#[no_mangle]
pub extern "C" fn echo(ptr: *const u8, len: usize) -> i64 {
    pack(ptr, len)
}

#[no_mangle]
pub extern "C" fn log_echo(ptr: *const u8, len: usize) -> i64 {
    let payload = unsafe { core::slice::from_raw_parts(ptr, len) };
    let _ = call("logger", "info", "", payload);
    pack(ptr, len)
}

#[no_mangle]
pub extern "C" fn remember(ptr: *const u8, len: usize) -> i64 {
    let payload = unsafe { core::slice::from_raw_parts(ptr, len) };
    let previous = call("kvstore", "get", "last", &[]).unwrap_or((0, 0));
    if call("kvstore", "set", "last", payload).is_err() {
        return -1;
    }
    pack(previous.0 as usize as *const u8, previous.1 as usize)
}
