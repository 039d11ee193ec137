//! Guest ABI shared by entrypoints and host calls.
//!
//! Results crossing the boundary are a single `i64`:
//!
//! ```text
//!  63   62..32         31..0
//! ┌───┬──────────────┬──────────────┐
//! │ E │ pointer (31) │ length (32)  │
//! └───┴──────────────┴──────────────┘
//! ```
//!
//! - `E = 0`: success, the bytes at `pointer..pointer+length` are the result.
//!   An empty result is `0`.
//! - `E = 1`: failure, the bytes are a JSON error document.
//! - [`HOST_CALL_FAILED`] (`-1`): failure with no document available.

use capsule_common::RuntimeError;

/// Import module name for host functions.
pub const IMPORT_MODULE: &str = "capsule";

/// Name of the host call import.
pub const HOST_CALL: &str = "host_call";

/// Optional guest export called when an instance goes back to its pool.
pub const RESET_EXPORT: &str = "reset";

/// Optional WASI reactor initializer, called once per instance.
pub const INITIALIZE_EXPORT: &str = "_initialize";

/// Result returned when a call failed and no error document could be written.
pub const HOST_CALL_FAILED: i64 = -1;

const ERROR_FLAG: u64 = 1 << 63;
const MAX_POINTER: u32 = i32::MAX as u32;

/// A decoded result value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packed {
    /// Success with the result at `ptr..ptr+len`.
    Ok { ptr: u32, len: u32 },
    /// Failure with an error document at `ptr..ptr+len`.
    Err { ptr: u32, len: u32 },
    /// Failure without a document.
    Failed,
}

/// Pack a successful result.
///
/// # Errors
///
/// Returns [`RuntimeError::MemoryFault`] if `ptr` does not fit in 31 bits.
pub fn pack(ptr: u32, len: u32) -> Result<i64, RuntimeError> {
    check_pointer(ptr)?;
    #[allow(clippy::cast_possible_wrap)]
    let value = ((u64::from(ptr) << 32) | u64::from(len)) as i64;
    Ok(value)
}

/// Pack a failure that carries an error document.
///
/// Falls back to [`HOST_CALL_FAILED`] when the location cannot be encoded.
pub fn pack_error(ptr: u32, len: u32) -> i64 {
    if check_pointer(ptr).is_err() {
        return HOST_CALL_FAILED;
    }
    #[allow(clippy::cast_possible_wrap)]
    let value = (ERROR_FLAG | (u64::from(ptr) << 32) | u64::from(len)) as i64;
    if value == HOST_CALL_FAILED {
        return HOST_CALL_FAILED;
    }
    value
}

/// Decode a result value.
pub fn unpack(value: i64) -> Packed {
    if value == HOST_CALL_FAILED {
        return Packed::Failed;
    }
    #[allow(clippy::cast_sign_loss)]
    let raw = value as u64;
    #[allow(clippy::cast_possible_truncation)]
    let ptr = ((raw & !ERROR_FLAG) >> 32) as u32;
    #[allow(clippy::cast_possible_truncation)]
    let len = raw as u32;
    if raw & ERROR_FLAG == 0 {
        Packed::Ok { ptr, len }
    } else {
        Packed::Err { ptr, len }
    }
}

fn check_pointer(ptr: u32) -> Result<(), RuntimeError> {
    if ptr > MAX_POINTER {
        return Err(RuntimeError::memory_fault(format!(
            "pointer {ptr:#x} cannot be encoded in a result"
        )));
    }
    Ok(())
}
