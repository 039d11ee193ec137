//! WebAssembly module compilation.
//!
//! This module provides [`CompiledModule`], a wrapper around Wasmtime's [`Module`]
//! that validates and compiles guest bytecode and records metadata about it.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Instant;

use tracing::{info, instrument};
use wasmtime::{Engine, ExternType, Module};

use capsule_common::RuntimeError;

/// A compiled WebAssembly module.
///
/// # Thread Safety
///
/// `CompiledModule` is read-only and cheap to clone; every instance in a
/// pool is created from the same compiled code.
#[derive(Clone)]
pub struct CompiledModule {
    /// The compiled Wasmtime module.
    inner: Module,

    /// Hash of the original Wasm bytes.
    content_hash: String,

    /// When this module was compiled.
    compiled_at: Instant,
}

impl CompiledModule {
    /// Compile a core module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails (e.g., invalid Wasm).
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine, bytes).map_err(|e| {
            RuntimeError::compilation_failed(format!("Core module compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(bytes);
        let duration = start.elapsed();

        info!(
            content_hash = %content_hash,
            duration_ms = duration.as_millis(),
            "Core module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Compile a core module from WAT (WebAssembly Text Format).
    ///
    /// This is primarily for testing purposes.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        let module = Module::new(engine, wat).map_err(|e| {
            RuntimeError::compilation_failed(format!("WAT compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(wat.as_bytes());
        let duration = start.elapsed();

        info!(
            content_hash = %content_hash,
            duration_ms = duration.as_millis(),
            "WAT module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Get the inner Wasmtime module.
    pub fn inner(&self) -> &Module {
        &self.inner
    }

    /// Get the content hash of the original Wasm bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get when this module was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Names of the exported functions.
    pub fn exported_functions(&self) -> Vec<String> {
        self.inner
            .exports()
            .filter(|export| matches!(export.ty(), ExternType::Func(_)))
            .map(|export| export.name().to_string())
            .collect()
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
        if bytes.len() < 8 {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: file too small",
            ));
        }

        // Check magic number: \0asm
        if &bytes[0..4] != b"\0asm" {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: bad magic number",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WasmEngine;
    use capsule_common::EngineConfig;

    // Minimal valid Wasm module (empty module)
    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, // magic: \0asm
        0x01, 0x00, 0x00, 0x00, // version: 1
    ];

    #[test]
    fn test_validate_wasm_header_valid() {
        assert!(CompiledModule::validate_wasm_header(MINIMAL_WASM).is_ok());
    }

    #[test]
    fn test_validate_wasm_header_too_small() {
        let result = CompiledModule::validate_wasm_header(&[0x00, 0x61]);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_wasm_header_bad_magic() {
        let bad_wasm = &[0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
        let result = CompiledModule::validate_wasm_header(bad_wasm);
        assert!(result.is_err());
    }

    #[test]
    fn test_compute_hash() {
        let hash1 = compute_hash(b"hello");
        let hash2 = compute_hash(b"hello");
        let hash3 = compute_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16);
    }

    #[test]
    fn test_module_compilation() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();

        let module = engine.compile(MINIMAL_WASM).unwrap();
        assert!(!module.content_hash().is_empty());
        assert!(module.exported_functions().is_empty());
    }

    #[test]
    fn test_exported_functions() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let module = engine
            .compile_wat(
                r#"(module
                    (memory (export "memory") 1)
                    (func (export "run") (param i32 i32) (result i64) i64.const 0))"#,
            )
            .unwrap();

        assert_eq!(module.exported_functions(), vec!["run".to_string()]);
    }

    #[test]
    fn test_module_debug() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let module = engine.compile(MINIMAL_WASM).unwrap();

        let debug_str = format!("{module:?}");
        assert!(debug_str.contains("CompiledModule"));
        assert!(debug_str.contains("content_hash"));
    }
}
