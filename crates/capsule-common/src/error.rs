//! Error types for capsule.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Top-level errors for loading and executing modules
//! - [`CallbackError`]: Errors produced by the host callback and capability handlers

use std::io;

use thiserror::Error;

/// Top-level runtime errors.
///
/// These errors represent failures that can occur during the lifecycle of
/// a module, from loading and compilation through pooled execution.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The requested module is not registered.
    #[error("Module not found: {module_id}")]
    ModuleNotFound {
        /// The name of the module that was not found.
        module_id: String,
    },

    /// A module with the same name is already registered.
    #[error("Module already loaded: {module_id}")]
    DuplicateModule {
        /// The name that is already taken.
        module_id: String,
    },

    /// The requested entrypoint is not exported with the expected signature.
    #[error("Entrypoint not found: {entrypoint}")]
    EntrypointNotFound {
        /// The entrypoint that was requested.
        entrypoint: String,
    },

    /// WebAssembly compilation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// Creating an instance from a compiled module failed.
    #[error("Instantiation failed: {reason}")]
    InstantiationFailed {
        /// Description of the instantiation failure.
        reason: String,
    },

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// Execution exceeded the configured timeout.
    #[error("Execution timeout after {duration_ms}ms")]
    ExecutionTimeout {
        /// The timeout duration in milliseconds.
        duration_ms: u64,
    },

    /// Execution exhausted the configured fuel limit.
    ///
    /// This indicates the WebAssembly code consumed more CPU cycles
    /// than allowed by the fuel metering configuration.
    #[error("Fuel exhausted: CPU limit exceeded")]
    FuelExhausted,

    /// The guest failed while running: a trap, or a failure it reported itself.
    #[error("Execution failed: {message}")]
    ExecutionFailed {
        /// Description of the failure.
        message: String,
        /// Trap code, when the failure was a trap.
        trap_code: Option<String>,
    },

    /// A guest pointer or length pair fell outside linear memory.
    #[error("Memory fault: {reason}")]
    MemoryFault {
        /// Description of the invalid access.
        reason: String,
    },

    /// No idle instance was available and the caller asked not to wait.
    #[error("Pool exhausted for module {module_id}")]
    PoolExhausted {
        /// The module whose pool is exhausted.
        module_id: String,
    },

    /// Waiting for an idle instance exceeded the caller's deadline.
    #[error("Timed out after {waited_ms}ms waiting for an instance")]
    Timeout {
        /// How long the caller waited in milliseconds.
        waited_ms: u64,
    },

    /// The caller cancelled the request while waiting.
    #[error("Request canceled")]
    Canceled,

    /// The pool was drained and accepts no more checkouts.
    #[error("Pool closed for module {module_id}")]
    PoolClosed {
        /// The module whose pool is closed.
        module_id: String,
    },

    /// The server has been shut down.
    #[error("Server closed")]
    ServerClosed,

    /// The host callback returned an error.
    #[error("Callback error: {0}")]
    Callback(#[from] CallbackError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from the host callback and capability handlers.
///
/// These errors are delivered back to the guest as a structured error
/// document rather than aborting the call.
#[derive(Error, Debug)]
pub enum CallbackError {
    /// No capability is registered for the namespace.
    #[error("Unknown namespace: {namespace}")]
    UnknownNamespace {
        /// The namespace that was requested.
        namespace: String,
    },

    /// The capability does not support the operation.
    #[error("Unknown operation: {namespace}/{operation}")]
    UnknownOperation {
        /// The namespace of the capability.
        namespace: String,
        /// The operation that was requested.
        operation: String,
    },

    /// The payload or key could not be interpreted.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },

    /// The addressed key does not exist.
    #[error("Key not found: {key}")]
    NotFound {
        /// The key that was looked up.
        key: String,
    },

    /// The handler failed.
    ///
    /// `payload` carries a handler-defined response document that should be
    /// delivered to the guest instead of the generic error document.
    #[error("Capability failed: {message}")]
    Failed {
        /// Description of the failure.
        message: String,
        /// Handler-defined response document.
        payload: Option<Vec<u8>>,
    },
}

impl RuntimeError {
    /// Create a new `ModuleNotFound` error.
    pub fn module_not_found(module_id: impl Into<String>) -> Self {
        Self::ModuleNotFound {
            module_id: module_id.into(),
        }
    }

    /// Create a new `DuplicateModule` error.
    pub fn duplicate_module(module_id: impl Into<String>) -> Self {
        Self::DuplicateModule {
            module_id: module_id.into(),
        }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `InstantiationFailed` error.
    pub fn instantiation_failed(reason: impl Into<String>) -> Self {
        Self::InstantiationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a new `ExecutionFailed` error without a trap code.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
            trap_code: None,
        }
    }

    /// Create a new `MemoryFault` error.
    pub fn memory_fault(reason: impl Into<String>) -> Self {
        Self::MemoryFault {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error indicates the module was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ModuleNotFound { .. } | Self::EntrypointNotFound { .. }
        )
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            Self::FuelExhausted | Self::ExecutionTimeout { .. }
        )
    }

    /// Returns `true` if the same request may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. } | Self::Timeout { .. })
    }

    /// Returns `true` if the server or pool has stopped accepting work.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ServerClosed | Self::PoolClosed { .. })
    }
}

impl CallbackError {
    /// Create a new `InvalidArgument` error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a new `Failed` error without a response document.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            payload: None,
        }
    }

    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownNamespace { .. } => "unknown_namespace",
            Self::UnknownOperation { .. } => "unknown_operation",
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::NotFound { .. } => "not_found",
            Self::Failed { .. } => "failed",
        }
    }

    /// The handler-defined response document, if one was attached.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Self::Failed {
                payload: Some(payload),
                ..
            } => Some(payload),
            _ => None,
        }
    }
}
