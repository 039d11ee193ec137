//! Fixed-size pools of warm instances.
//!
//! Each loaded module owns one [`InstancePool`]. The pool is filled when it
//! is created and never grows: a caller checks out an idle instance,
//! executes on it exclusively, then returns it. Returned instances are reset
//! and reused; faulted instances are destroyed and replaced.
//!
//! Capacity is tracked with a semaphore holding one permit per live
//! instance. A lease holds its permit until the instance is back in the
//! idle list or has been replaced, so the number of available permits never
//! exceeds the number of idle instances.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::instance::{Instance, InstanceFactory, InstanceState};
use crate::{CallContext, Interrupted};
use capsule_common::RuntimeError;

/// A pool of instances of one module.
///
/// Cheap to clone; clones share the same instances.
#[derive(Clone)]
pub struct InstancePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    module_id: String,
    factory: Arc<InstanceFactory>,
    size: usize,
    idle: Mutex<Vec<Instance>>,
    permits: Arc<Semaphore>,
    capacity: AtomicUsize,
    leased: AtomicUsize,
    destroyed: AtomicU64,
    replaced: AtomicU64,
    closed: AtomicBool,
    returned: Notify,
    checkout_timeout: Option<Duration>,
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    /// Module the pool serves.
    pub module_id: String,
    /// Configured number of instances.
    pub size: usize,
    /// Live instances. Lower than `size` after failed replacements.
    pub capacity: usize,
    /// Instances waiting to be checked out.
    pub idle: usize,
    /// Instances currently checked out.
    pub leased: usize,
    /// Instances destroyed over the pool's lifetime.
    pub destroyed: u64,
    /// Faulted instances successfully replaced.
    pub replaced: u64,
    /// Whether the pool has been drained.
    pub closed: bool,
}

impl PoolStatus {
    /// Returns `true` if the pool lost instances it could not replace.
    pub fn is_degraded(&self) -> bool {
        self.capacity < self.size
    }
}

/// Result of [`InstancePool::drain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Idle instances destroyed by the drain.
    pub destroyed: usize,
    /// Leases still outstanding when the drain gave up waiting.
    ///
    /// Their instances are destroyed when they are returned.
    pub outstanding: usize,
}

impl InstancePool {
    /// Create a pool and fill it with `size` instances.
    ///
    /// `checkout_timeout` bounds the wait in [`InstancePool::checkout`] when
    /// the caller's context has no deadline of its own.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::InvalidConfig`] if `size` is zero
    /// - Any instantiation error; no partially-filled pool is returned
    #[instrument(skip(factory), fields(module = %factory.module_name()))]
    pub async fn new(
        factory: Arc<InstanceFactory>,
        size: usize,
        checkout_timeout: Option<Duration>,
    ) -> Result<Self, RuntimeError> {
        if size == 0 {
            return Err(RuntimeError::invalid_config("pool size must be at least 1"));
        }

        let mut instances = Vec::with_capacity(size);
        for _ in 0..size {
            instances.push(factory.instantiate().await?);
        }

        info!(size, "Instance pool filled");

        Ok(Self {
            inner: Arc::new(PoolInner {
                module_id: factory.module_name().to_string(),
                factory,
                size,
                idle: Mutex::new(instances),
                permits: Arc::new(Semaphore::new(size)),
                capacity: AtomicUsize::new(size),
                leased: AtomicUsize::new(0),
                destroyed: AtomicU64::new(0),
                replaced: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                returned: Notify::new(),
                checkout_timeout,
            }),
        })
    }

    /// Module this pool serves.
    pub fn module_id(&self) -> &str {
        &self.inner.module_id
    }

    /// Configured number of instances.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Check out an idle instance, waiting for one if all are leased.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::Timeout`] if the deadline passes while waiting
    /// - [`RuntimeError::Canceled`] if `ctx` is cancelled while waiting
    /// - [`RuntimeError::PoolClosed`] if the pool is or becomes drained
    pub async fn checkout(&self, ctx: &CallContext) -> Result<PooledInstance, RuntimeError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(self.inner.closed_error());
        }

        let ctx = match (ctx.deadline(), self.inner.checkout_timeout) {
            (None, Some(timeout)) => ctx.clone().with_timeout(timeout),
            _ => ctx.clone(),
        };

        let start = Instant::now();
        let acquired = ctx
            .guard(Arc::clone(&self.inner.permits).acquire_owned())
            .await;

        let permit = match acquired {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(self.inner.closed_error()),
            Err(Interrupted::Canceled) => return Err(RuntimeError::Canceled),
            Err(Interrupted::DeadlineExceeded) => {
                let waited_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                debug!(module = %self.inner.module_id, waited_ms, "Checkout timed out");
                return Err(RuntimeError::Timeout { waited_ms });
            }
        };

        self.inner.lease(permit)
    }

    /// Check out an idle instance without waiting.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::PoolExhausted`] if every instance is leased
    /// - [`RuntimeError::PoolClosed`] if the pool is drained
    pub fn try_checkout(&self) -> Result<PooledInstance, RuntimeError> {
        match Arc::clone(&self.inner.permits).try_acquire_owned() {
            Ok(permit) => self.inner.lease(permit),
            Err(TryAcquireError::NoPermits) => Err(RuntimeError::PoolExhausted {
                module_id: self.inner.module_id.clone(),
            }),
            Err(TryAcquireError::Closed) => Err(self.inner.closed_error()),
        }
    }

    /// Return a leased instance.
    ///
    /// Healthy instances are reset and made idle. Faulted instances, and
    /// instances whose reset fails, are destroyed and replaced.
    pub async fn return_instance(&self, lease: PooledInstance) {
        lease.release().await;
    }

    /// Close the pool and destroy its instances.
    ///
    /// New checkouts fail with [`RuntimeError::PoolClosed`] immediately.
    /// Waits up to `timeout` for outstanding leases to come back.
    #[instrument(skip(self), fields(module = %self.inner.module_id))]
    pub async fn drain(&self, timeout: Duration) -> DrainOutcome {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.permits.close();

        let deadline = Instant::now().checked_add(timeout);
        loop {
            let returned = self.inner.returned.notified();
            if self.inner.leased.load(Ordering::Acquire) == 0 {
                break;
            }
            let Some(deadline) = deadline else {
                returned.await;
                continue;
            };
            if tokio::time::timeout_at(deadline, returned).await.is_err() {
                break;
            }
        }

        let idle = std::mem::take(&mut *self.inner.idle.lock());
        let destroyed = idle.len();
        drop(idle);
        self.inner.destroyed.fetch_add(destroyed as u64, Ordering::Relaxed);

        let outstanding = self.inner.leased.load(Ordering::Acquire);
        if outstanding > 0 {
            warn!(outstanding, "Drain timed out with leases outstanding");
        }
        info!(destroyed, "Instance pool drained");

        DrainOutcome {
            destroyed,
            outstanding,
        }
    }

    /// Current pool status.
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            module_id: self.inner.module_id.clone(),
            size: self.inner.size,
            capacity: self.inner.capacity.load(Ordering::Acquire),
            idle: self.inner.idle.lock().len(),
            leased: self.inner.leased.load(Ordering::Acquire),
            destroyed: self.inner.destroyed.load(Ordering::Relaxed),
            replaced: self.inner.replaced.load(Ordering::Relaxed),
            closed: self.inner.closed.load(Ordering::Acquire),
        }
    }

    /// Returns `true` once the pool has been drained.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("module_id", &self.inner.module_id)
            .field("size", &self.inner.size)
            .finish_non_exhaustive()
    }
}

impl PoolInner {
    fn closed_error(&self) -> RuntimeError {
        RuntimeError::PoolClosed {
            module_id: self.module_id.clone(),
        }
    }

    fn lease(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> Result<PooledInstance, RuntimeError> {
        let instance = {
            let mut idle = self.idle.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(self.closed_error());
            }
            idle.pop()
        };

        let Some(mut instance) = instance else {
            error!(module = %self.module_id, "Permit acquired with no idle instance");
            return Err(RuntimeError::execution("no idle instance available"));
        };

        instance.set_state(InstanceState::Leased);
        self.leased.fetch_add(1, Ordering::AcqRel);

        Ok(PooledInstance {
            slot: Some((instance, permit)),
            pool: Arc::clone(self),
        })
    }

    async fn restore(self: Arc<Self>, mut instance: Instance, permit: OwnedSemaphorePermit) {
        let id = instance.id();

        if !instance.is_faulted() {
            match instance.reset().await {
                Ok(()) => {
                    instance.set_state(InstanceState::Idle);
                    let mut idle = self.idle.lock();
                    if !self.closed.load(Ordering::Acquire) {
                        idle.push(instance);
                        drop(idle);
                        drop(permit);
                        self.finish_return();
                        return;
                    }
                }
                Err(e) => warn!(module = %self.module_id, instance_id = id, error = %e, "Reset failed"),
            }
        }

        // Release the store's memory and slot before instantiating its replacement.
        drop(instance);
        self.destroyed.fetch_add(1, Ordering::Relaxed);

        if self.closed.load(Ordering::Acquire) {
            debug!(module = %self.module_id, instance_id = id, "Instance destroyed after drain");
            drop(permit);
            self.finish_return();
            return;
        }

        warn!(module = %self.module_id, instance_id = id, "Replacing faulted instance");
        match self.factory.instantiate().await {
            Ok(replacement) => {
                let mut idle = self.idle.lock();
                if self.closed.load(Ordering::Acquire) {
                    drop(idle);
                    self.destroyed.fetch_add(1, Ordering::Relaxed);
                } else {
                    idle.push(replacement);
                    drop(idle);
                    self.replaced.fetch_add(1, Ordering::Relaxed);
                }
                drop(permit);
            }
            Err(e) => self.shrink(permit, &e),
        }

        self.finish_return();
    }

    fn shrink(&self, permit: OwnedSemaphorePermit, cause: &RuntimeError) {
        // The permit stands for the lost instance; it must not be reissued.
        permit.forget();
        let capacity = self
            .capacity
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1);
        error!(
            module = %self.module_id,
            capacity,
            size = self.size,
            error = %cause,
            "Instance replacement failed, pool degraded"
        );
    }

    fn finish_return(&self) {
        self.leased.fetch_sub(1, Ordering::AcqRel);
        self.returned.notify_waiters();
    }
}

/// An instance checked out of a pool.
///
/// Return it with [`InstancePool::return_instance`] or
/// [`PooledInstance::release`]. A lease dropped without being returned is
/// treated as faulted: the instance is destroyed and replaced in the
/// background.
pub struct PooledInstance {
    slot: Option<(Instance, OwnedSemaphorePermit)>,
    pool: Arc<PoolInner>,
}

impl PooledInstance {
    /// The leased instance.
    pub fn instance(&self) -> Option<&Instance> {
        self.slot.as_ref().map(|(instance, _)| instance)
    }

    /// Call `entrypoint` on the leased instance.
    ///
    /// # Errors
    ///
    /// See [`Instance::call`].
    pub async fn call(
        &mut self,
        ctx: &CallContext,
        entrypoint: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, RuntimeError> {
        let Some((instance, _)) = self.slot.as_mut() else {
            return Err(RuntimeError::execution("lease already released"));
        };
        instance.call(ctx, entrypoint, payload).await
    }

    /// Give the instance back to its pool.
    pub async fn release(mut self) {
        if let Some((instance, permit)) = self.slot.take() {
            Arc::clone(&self.pool).restore(instance, permit).await;
        }
    }
}

impl Drop for PooledInstance {
    fn drop(&mut self) {
        let Some((mut instance, permit)) = self.slot.take() else {
            return;
        };
        instance.set_state(InstanceState::Faulted);

        let pool = Arc::clone(&self.pool);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(module = %pool.module_id, instance_id = instance.id(), "Lease abandoned");
                handle.spawn(pool.restore(instance, permit));
            }
            Err(_) => {
                drop(instance);
                pool.destroyed.fetch_add(1, Ordering::Relaxed);
                pool.shrink(
                    permit,
                    &RuntimeError::execution("lease abandoned outside a runtime"),
                );
                pool.finish_return();
            }
        }
    }
}

impl std::fmt::Debug for PooledInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledInstance")
            .field("module_id", &self.pool.module_id)
            .field("instance", &self.instance().map(Instance::id))
            .finish()
    }
}
