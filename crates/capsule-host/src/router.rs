//! Namespace-based dispatch to capability handlers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::Callback;
use capsule_common::CallbackError;
use capsule_core::CallContext;

/// A host capability serving one namespace.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Namespace this capability answers to.
    fn namespace(&self) -> &str;

    /// Handle `operation` within the namespace.
    async fn call(
        &self,
        ctx: &CallContext,
        operation: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, CallbackError>;
}

/// A [`Callback`] that dispatches on namespace.
///
/// # Example
///
/// ```ignore
/// let router = CapabilityRouter::new()
///     .with(KvStoreCapability::new())
///     .with(LoggerCapability::new());
/// let callback: Arc<dyn Callback> = Arc::new(router);
/// ```
#[derive(Default)]
pub struct CapabilityRouter {
    handlers: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a capability, builder style.
    #[must_use]
    pub fn with(mut self, capability: impl Capability + 'static) -> Self {
        self.register(Arc::new(capability));
        self
    }

    /// Add a capability, replacing any previous handler for its namespace.
    pub fn register(&mut self, capability: Arc<dyn Capability>) -> Option<Arc<dyn Capability>> {
        let namespace = capability.namespace().to_string();
        debug!(namespace = %namespace, "Capability registered");
        self.handlers.insert(namespace, capability)
    }

    /// Registered namespaces, sorted.
    pub fn namespaces(&self) -> Vec<&str> {
        let mut namespaces: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        namespaces.sort_unstable();
        namespaces
    }

    /// Returns `true` if a handler serves `namespace`.
    pub fn contains(&self, namespace: &str) -> bool {
        self.handlers.contains_key(namespace)
    }
}

#[async_trait]
impl Callback for CapabilityRouter {
    #[instrument(skip(self, ctx, key, payload), fields(request_id = %ctx.request_id()))]
    async fn call(
        &self,
        ctx: &CallContext,
        namespace: &str,
        operation: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, CallbackError> {
        let Some(handler) = self.handlers.get(namespace) else {
            return Err(CallbackError::UnknownNamespace {
                namespace: namespace.to_string(),
            });
        };

        handler.call(ctx, operation, key, payload).await
    }
}

impl std::fmt::Debug for CapabilityRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRouter")
            .field("namespaces", &self.namespaces())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    #[async_trait]
    impl Capability for Upper {
        fn namespace(&self) -> &str {
            "upper"
        }

        async fn call(
            &self,
            _ctx: &CallContext,
            operation: &str,
            _key: &str,
            payload: &[u8],
        ) -> Result<Vec<u8>, CallbackError> {
            match operation {
                "apply" => Ok(payload.to_ascii_uppercase()),
                _ => Err(CallbackError::UnknownOperation {
                    namespace: "upper".into(),
                    operation: operation.into(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn test_dispatch_by_namespace() {
        let router = CapabilityRouter::new().with(Upper);
        let result = router
            .call(&CallContext::new(), "upper", "apply", "", b"abc")
            .await
            .unwrap();
        assert_eq!(result, b"ABC");
    }

    #[tokio::test]
    async fn test_unknown_namespace() {
        let router = CapabilityRouter::new().with(Upper);
        let err = router
            .call(&CallContext::new(), "sql", "query", "", b"")
            .await
            .unwrap_err();
        assert!(matches!(err, CallbackError::UnknownNamespace { namespace } if namespace == "sql"));
    }

    #[tokio::test]
    async fn test_unknown_operation_from_handler() {
        let router = CapabilityRouter::new().with(Upper);
        let err = router
            .call(&CallContext::new(), "upper", "lower", "", b"")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_operation");
    }

    #[test]
    fn test_register_replaces() {
        let mut router = CapabilityRouter::new();
        assert!(router.register(Arc::new(Upper)).is_none());
        assert!(router.register(Arc::new(Upper)).is_some());
        assert_eq!(router.namespaces(), vec!["upper"]);
        assert!(router.contains("upper"));
    }
}
