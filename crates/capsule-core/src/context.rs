//! Per-call context: request identity, deadline, and cancellation.
//!
//! A [`CallContext`] travels with a request from the caller, through pool
//! checkout and guest execution, into every host call the guest makes.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

/// Context carried through a single execution.
#[derive(Debug, Clone)]
pub struct CallContext {
    request_id: String,
    module: Option<String>,
    entrypoint: Option<String>,
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Cancels every context derived from [`CallContext::cancellable`].
///
/// Dropping the handle without calling [`CancelHandle::cancel`] does not
/// cancel anything.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Why a guarded future stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    /// The context's deadline passed.
    DeadlineExceeded,
    /// The context was cancelled.
    Canceled,
}

impl CallContext {
    /// Create a context with a fresh request id and no deadline.
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            module: None,
            entrypoint: None,
            deadline: None,
            cancel: None,
        }
    }

    /// Set the deadline to `timeout` from now.
    ///
    /// A timeout too large to represent leaves the context without a deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Instant::now().checked_add(timeout);
        self
    }

    /// Set an absolute deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Replace the generated request id.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Attach a cancellation channel.
    pub fn cancellable(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        self.cancel = Some(rx);
        (self, CancelHandle { tx })
    }

    /// Copy of this context naming the module and entrypoint being executed.
    pub fn scoped(&self, module: &str, entrypoint: &str) -> Self {
        let mut ctx = self.clone();
        ctx.module = Some(module.to_string());
        ctx.entrypoint = Some(entrypoint.to_string());
        ctx
    }

    /// Request identifier used in logs.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Module being executed, if scoped.
    pub fn module(&self) -> Option<&str> {
        self.module.as_deref()
    }

    /// Entrypoint being executed, if scoped.
    pub fn entrypoint(&self) -> Option<&str> {
        self.entrypoint.as_deref()
    }

    /// The absolute deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` means unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Returns `true` once the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Returns `true` once cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Run `fut` until it completes, the deadline passes, or the context
    /// is cancelled, whichever comes first.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if `fut` did not complete. `fut` is dropped.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        if self.is_cancelled() {
            return Err(Interrupted::Canceled);
        }
        if self.is_expired() {
            return Err(Interrupted::DeadlineExceeded);
        }

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        let cancelled = async {
            let Some(mut rx) = self.cancel.clone() else {
                return std::future::pending().await;
            };
            let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
            if closed {
                // Sender dropped without cancelling.
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            biased;
            output = fut => Ok(output),
            () = cancelled => Err(Interrupted::Canceled),
            () = deadline => Err(Interrupted::DeadlineExceeded),
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_context_has_unique_id() {
        let a = CallContext::new();
        let b = CallContext::new();
        assert_ne!(a.request_id(), b.request_id());
        assert!(a.deadline().is_none());
        assert!(a.remaining().is_none());
        assert!(!a.is_cancelled());
    }

    #[test]
    fn test_scoped_keeps_identity() {
        let ctx = CallContext::new().with_request_id("req-1");
        let scoped = ctx.scoped("echo", "run");
        assert_eq!(scoped.request_id(), "req-1");
        assert_eq!(scoped.module(), Some("echo"));
        assert_eq!(scoped.entrypoint(), Some("run"));
        assert!(ctx.module().is_none());
    }

    #[test]
    fn test_huge_timeout_is_unbounded() {
        let ctx = CallContext::new().with_timeout(Duration::MAX);
        assert!(ctx.deadline().is_none());
    }

    #[tokio::test]
    async fn test_guard_completes() {
        let ctx = CallContext::new().with_timeout(Duration::from_secs(5));
        let result = ctx.guard(async { 42 }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_guard_deadline() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(20));
        let result = ctx.guard(std::future::pending::<()>()).await;
        assert_eq!(result, Err(Interrupted::DeadlineExceeded));
        assert!(ctx.is_expired());
    }

    #[tokio::test]
    async fn test_guard_cancel() {
        let (ctx, handle) = CallContext::new().cancellable();
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.guard(std::future::pending::<()>()).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        let result = waiter.await.unwrap();
        assert_eq!(result, Err(Interrupted::Canceled));
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_guard_already_cancelled() {
        let (ctx, handle) = CallContext::new().cancellable();
        handle.cancel();

        // Cancellation is checked before the future is polled at all.
        assert_eq!(
            tokio_test::block_on(ctx.guard(async { 1 })),
            Err(Interrupted::Canceled)
        );
        let result = tokio_test::block_on(ctx.guard(std::future::pending::<()>()));
        assert_eq!(result, Err(Interrupted::Canceled));
    }

    #[tokio::test]
    async fn test_dropped_handle_does_not_cancel() {
        let (ctx, handle) = CallContext::new().cancellable();
        drop(handle);
        let ctx = ctx.with_timeout(Duration::from_millis(20));
        let result = ctx.guard(std::future::pending::<()>()).await;
        assert_eq!(result, Err(Interrupted::DeadlineExceeded));
    }
}
