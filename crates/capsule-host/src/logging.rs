//! Guest logging capability.
//!
//! Namespace `logger`; the operation is the level (`error`, `warn`, `info`,
//! `debug`, `trace`) and the payload is the message. Messages are emitted
//! through `tracing`, tagged with the module, entrypoint, and request id of
//! the call that produced them.

use async_trait::async_trait;
use tracing::{Level, debug, error, info, trace, warn};

use crate::Capability;
use capsule_common::CallbackError;
use capsule_core::CallContext;

/// Namespace served by [`LoggerCapability`].
pub const NAMESPACE: &str = "logger";

/// Host implementation for guest logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggerCapability;

impl LoggerCapability {
    /// Create the capability.
    pub fn new() -> Self {
        Self
    }

    /// Emit a guest message at `level`.
    pub fn log(ctx: &CallContext, level: Level, message: &str) {
        let request_id = ctx.request_id();
        let module = ctx.module().unwrap_or_default();
        let entrypoint = ctx.entrypoint().unwrap_or_default();

        match level {
            Level::ERROR => error!(request_id, module, entrypoint, guest_log = true, "{message}"),
            Level::WARN => warn!(request_id, module, entrypoint, guest_log = true, "{message}"),
            Level::INFO => info!(request_id, module, entrypoint, guest_log = true, "{message}"),
            Level::DEBUG => debug!(request_id, module, entrypoint, guest_log = true, "{message}"),
            _ => trace!(request_id, module, entrypoint, guest_log = true, "{message}"),
        }
    }
}

/// Parse an operation name into a log level.
pub fn level_from_operation(operation: &str) -> Option<Level> {
    match operation {
        "error" => Some(Level::ERROR),
        "warn" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

#[async_trait]
impl Capability for LoggerCapability {
    fn namespace(&self) -> &str {
        NAMESPACE
    }

    async fn call(
        &self,
        ctx: &CallContext,
        operation: &str,
        _key: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, CallbackError> {
        let Some(level) = level_from_operation(operation) else {
            return Err(CallbackError::UnknownOperation {
                namespace: NAMESPACE.to_string(),
                operation: operation.to_string(),
            });
        };

        Self::log(ctx, level, &String::from_utf8_lossy(payload));
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_operation() {
        assert_eq!(level_from_operation("error"), Some(Level::ERROR));
        assert_eq!(level_from_operation("warn"), Some(Level::WARN));
        assert_eq!(level_from_operation("info"), Some(Level::INFO));
        assert_eq!(level_from_operation("debug"), Some(Level::DEBUG));
        assert_eq!(level_from_operation("trace"), Some(Level::TRACE));
        assert_eq!(level_from_operation("fatal"), None);
    }

    #[test]
    fn test_log_returns_empty() {
        let ctx = CallContext::new().scoped("hello", "run");
        let result = tokio_test::block_on(LoggerCapability::new().call(
            &ctx,
            "info",
            "",
            b"hello from guest",
        ))
        .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_logged_lossily() {
        let result = LoggerCapability::new()
            .call(&CallContext::new(), "warn", "", &[0xff, 0xfe])
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_level() {
        let err = LoggerCapability::new()
            .call(&CallContext::new(), "fatal", "", b"x")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_operation");
    }
}
