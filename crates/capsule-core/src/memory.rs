//! Bounds-checked access to guest linear memory.
//!
//! Guest pointers and lengths are `i32` on the wire but unsigned in wasm32,
//! so they are reinterpreted as `u32` before any arithmetic. Every access is
//! checked against the current memory size; nothing here can read or write
//! outside the guest's memory.

use std::ops::Range;

use wasmtime::{AsContext, AsContextMut, Memory, TypedFunc};

use crate::instance::trap_code;
use capsule_common::{CallbackError, RuntimeError};

/// Validate a guest `(ptr, len)` pair against `memory_size`.
///
/// # Errors
///
/// Returns [`RuntimeError::MemoryFault`] if the range overflows or ends
/// past the end of memory.
#[allow(clippy::cast_sign_loss)]
pub fn checked_range(ptr: i32, len: i32, memory_size: usize) -> Result<Range<usize>, RuntimeError> {
    span(ptr as u32 as usize, len as u32 as usize, memory_size)
}

fn span(start: usize, len: usize, memory_size: usize) -> Result<Range<usize>, RuntimeError> {
    let Some(end) = start.checked_add(len) else {
        return Err(RuntimeError::memory_fault(format!(
            "pointer {start:#x} + length {len} overflows"
        )));
    };

    if end > memory_size {
        return Err(RuntimeError::memory_fault(format!(
            "range {start:#x}..{end:#x} exceeds memory size {memory_size:#x}"
        )));
    }

    Ok(start..end)
}

/// Copy `len` bytes at `ptr` out of guest memory.
pub fn read_bytes(
    memory: &Memory,
    store: impl AsContext,
    ptr: i32,
    len: i32,
) -> Result<Vec<u8>, RuntimeError> {
    let data = memory.data(&store);
    let range = checked_range(ptr, len, data.len())?;
    Ok(data[range].to_vec())
}

/// Copy a region described by a decoded result value out of guest memory.
pub fn read_region(
    memory: &Memory,
    store: impl AsContext,
    ptr: u32,
    len: u32,
) -> Result<Vec<u8>, RuntimeError> {
    let data = memory.data(&store);
    let range = span(ptr as usize, len as usize, data.len())?;
    Ok(data[range].to_vec())
}

/// Copy a UTF-8 string out of guest memory.
pub fn read_string(
    memory: &Memory,
    store: impl AsContext,
    ptr: i32,
    len: i32,
) -> Result<String, RuntimeError> {
    let bytes = read_bytes(memory, store, ptr, len)?;
    String::from_utf8(bytes).map_err(|_| {
        RuntimeError::Callback(CallbackError::invalid_argument(format!(
            "string at {ptr:#x} is not valid UTF-8"
        )))
    })
}

/// Copy `bytes` into guest memory at `ptr`.
pub fn write_bytes(
    memory: &Memory,
    mut store: impl AsContextMut,
    ptr: u32,
    bytes: &[u8],
) -> Result<(), RuntimeError> {
    let data = memory.data_mut(&mut store);
    let range = span(ptr as usize, bytes.len(), data.len())?;
    data[range].copy_from_slice(bytes);
    Ok(())
}

/// Ask the guest allocator for `len` bytes.
///
/// # Errors
///
/// - [`RuntimeError::MemoryFault`] if `len` does not fit the guest address
///   space or the allocator returns null
/// - [`RuntimeError::ExecutionFailed`] if the allocator traps
pub async fn allocate<S>(
    mut store: S,
    allocator: &TypedFunc<i32, i32>,
    len: usize,
) -> Result<u32, RuntimeError>
where
    S: AsContextMut + Send,
    S::Data: Send,
{
    let requested = i32::try_from(len).map_err(|_| {
        RuntimeError::memory_fault(format!(
            "allocation of {len} bytes exceeds the guest address space"
        ))
    })?;

    let ptr = allocator
        .call_async(&mut store, requested)
        .await
        .map_err(|e| RuntimeError::ExecutionFailed {
            message: format!("guest allocator failed: {e}"),
            trap_code: trap_code(&e),
        })?;

    if ptr == 0 {
        return Err(RuntimeError::memory_fault("guest allocator returned null"));
    }

    #[allow(clippy::cast_sign_loss)]
    Ok(ptr as u32)
}

/// Allocate guest memory and copy `bytes` into it.
///
/// Empty input is not allocated and yields pointer `0`.
pub async fn write_allocated<S>(
    memory: &Memory,
    mut store: S,
    allocator: &TypedFunc<i32, i32>,
    bytes: &[u8],
) -> Result<u32, RuntimeError>
where
    S: AsContextMut + Send,
    S::Data: Send,
{
    if bytes.is_empty() {
        return Ok(0);
    }
    let ptr = allocate(&mut store, allocator, bytes.len()).await?;
    write_bytes(memory, &mut store, ptr, bytes)?;
    Ok(ptr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_range_valid() {
        assert_eq!(checked_range(0, 4, 16).unwrap(), 0..4);
        assert_eq!(checked_range(12, 4, 16).unwrap(), 12..16);
        assert_eq!(checked_range(16, 0, 16).unwrap(), 16..16);
    }

    #[test]
    fn test_checked_range_past_end() {
        assert!(matches!(
            checked_range(13, 4, 16),
            Err(RuntimeError::MemoryFault { .. })
        ));
        assert!(checked_range(17, 0, 16).is_err());
    }

    #[test]
    fn test_checked_range_negative_values() {
        // Negative i32 values are large unsigned wasm32 addresses.
        assert!(checked_range(-1, 1, 65536).is_err());
        assert!(checked_range(0, -1, 65536).is_err());
    }

    #[test]
    fn test_span_overflow() {
        assert!(matches!(
            span(usize::MAX, 2, usize::MAX),
            Err(RuntimeError::MemoryFault { .. })
        ));
    }
}
