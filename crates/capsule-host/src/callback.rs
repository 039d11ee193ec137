//! The host callback contract.
//!
//! Every host call a guest makes is routed to a single [`Callback`] supplied
//! when the server is created. The callback sees the call's [`CallContext`]
//! and the four values the guest passed: namespace, operation, key, payload.

use std::future::Future;

use async_trait::async_trait;

use capsule_common::CallbackError;
use capsule_core::CallContext;

/// Handler for guest host calls.
///
/// Implementations must be safe to call in parallel from many instances.
#[async_trait]
pub trait Callback: Send + Sync {
    /// Handle one host call and return the bytes to hand back to the guest.
    async fn call(
        &self,
        ctx: &CallContext,
        namespace: &str,
        operation: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, CallbackError>;
}

/// An owned copy of a host call's arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallRequest {
    /// Capability namespace, e.g. `httpclient`.
    pub namespace: String,
    /// Operation within the namespace.
    pub operation: String,
    /// Operation-specific key; may be empty.
    pub key: String,
    /// Opaque payload.
    pub payload: Vec<u8>,
}

/// Adapts an async closure into a [`Callback`].
///
/// ```ignore
/// let callback = FnCallback::new(|_ctx, request| async move {
///     Ok(request.payload)
/// });
/// ```
pub struct FnCallback<F> {
    f: F,
}

impl<F> FnCallback<F> {
    /// Wrap `f`.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Callback for FnCallback<F>
where
    F: Fn(CallContext, CallRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<u8>, CallbackError>> + Send,
{
    async fn call(
        &self,
        ctx: &CallContext,
        namespace: &str,
        operation: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, CallbackError> {
        let request = CallRequest {
            namespace: namespace.to_string(),
            operation: operation.to_string(),
            key: key.to_string(),
            payload: payload.to_vec(),
        };
        (self.f)(ctx.clone(), request).await
    }
}

impl<F> std::fmt::Debug for FnCallback<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnCallback").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_callback_receives_arguments() {
        let callback = FnCallback::new(|ctx: CallContext, request: CallRequest| async move {
            assert_eq!(ctx.request_id(), "req-7");
            Ok(format!(
                "{}/{}/{}/{}",
                request.namespace,
                request.operation,
                request.key,
                String::from_utf8_lossy(&request.payload)
            )
            .into_bytes())
        });

        let ctx = CallContext::new().with_request_id("req-7");
        let result = callback
            .call(&ctx, "ns", "op", "key", b"body")
            .await
            .unwrap();
        assert_eq!(result, b"ns/op/key/body");
    }

    #[tokio::test]
    async fn test_fn_callback_error() {
        let callback = FnCallback::new(|_ctx: CallContext, _request: CallRequest| async move {
            Err::<Vec<u8>, _>(CallbackError::failed("nope"))
        });

        let err = callback
            .call(&CallContext::new(), "ns", "op", "", b"")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "failed");
    }
}
