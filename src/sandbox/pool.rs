//! Pooling of interpreter instances.
//!
//! Two interchangeable pools sit behind [`InstancePool`]:
//!
//! - [`BoundedPool`] admits at most `capacity` concurrent checkouts, creating
//!   instances lazily and blocking further callers until one is returned.
//! - [`SharedPool`] hands the same eagerly created instance to every caller.
//!   There is no isolation between concurrent evaluations in this mode; it
//!   exists for single-threaded callers that want no queueing overhead.
//!
//! Every checkout goes through [`PooledInstance`], which returns the instance
//! when dropped.

use std::num::NonZeroUsize;
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, SandboxError};
use crate::sandbox::cancel::Context;
use crate::sandbox::instance::Instance;

/// Creates a new instance given its id.
pub type InstanceFactory = Box<dyn Fn(u64) -> Result<Instance> + Send + Sync>;

/// Longest a context-aware waiter sleeps before re-checking its context.
const CONTEXT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Maximum concurrent checkouts, `None` for the shared pool.
    pub capacity: Option<usize>,
    /// Instances waiting in the pool.
    pub idle: usize,
    /// Instances currently checked out.
    pub in_use: usize,
    /// Instances created over the pool's lifetime.
    pub created: u64,
}

/// A source of interpreter instances.
pub trait InstancePool: Send + Sync {
    /// Check out an instance, blocking while none is available. A done
    /// `ctx` stops the wait with the context's error.
    fn get(&self, ctx: Option<&Context>) -> Result<Arc<Instance>>;

    /// Return an instance obtained from [`get`](Self::get).
    fn put(&self, instance: Arc<Instance>);

    /// Drop idle instances. Checked-out instances are dropped when returned.
    fn shutdown(&self);

    fn stats(&self) -> PoolStats;
}

/// Check out an instance that goes back to `pool` when the guard drops.
pub fn checkout<'a>(pool: &'a dyn InstancePool, ctx: Option<&Context>) -> Result<PooledInstance<'a>> {
    let instance = pool.get(ctx)?;
    Ok(PooledInstance { pool, instance })
}

/// Scoped checkout of an [`Instance`].
pub struct PooledInstance<'a> {
    pool: &'a dyn InstancePool,
    instance: Arc<Instance>,
}

impl Deref for PooledInstance<'_> {
    type Target = Instance;

    fn deref(&self) -> &Instance {
        &self.instance
    }
}

impl Drop for PooledInstance<'_> {
    fn drop(&mut self) {
        self.pool.put(Arc::clone(&self.instance));
    }
}

struct BoundedState {
    idle: Vec<Arc<Instance>>,
    in_use: usize,
    created: u64,
    closed: bool,
}

/// Pool with an admission limit.
pub struct BoundedPool {
    capacity: usize,
    factory: InstanceFactory,
    state: Mutex<BoundedState>,
    available: Condvar,
}

impl BoundedPool {
    /// Create an empty pool. Instances are created by `factory` on demand,
    /// never more than `capacity` of them.
    pub fn new(capacity: NonZeroUsize, factory: InstanceFactory) -> Self {
        Self {
            capacity: capacity.get(),
            factory,
            state: Mutex::new(BoundedState {
                idle: Vec::with_capacity(capacity.get()),
                in_use: 0,
                created: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BoundedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Block until a slot is free. Returns the locked state with the slot taken.
    fn admit(&self, ctx: Option<&Context>) -> Result<MutexGuard<'_, BoundedState>> {
        let mut state = self.lock();
        let mut logged = false;
        loop {
            if state.closed {
                return Err(SandboxError::EngineClosed);
            }
            if state.in_use < self.capacity {
                state.in_use += 1;
                return Ok(state);
            }
            if !logged {
                debug!(capacity = self.capacity, "pool exhausted, waiting for an instance");
                logged = true;
            }
            state = match ctx {
                None => self
                    .available
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(ctx) => {
                    if let Some(err) = ctx.err() {
                        return Err(err);
                    }
                    let wait = ctx
                        .remaining()
                        .map_or(CONTEXT_POLL_INTERVAL, |left| left.min(CONTEXT_POLL_INTERVAL));
                    self.available
                        .wait_timeout(state, wait)
                        .map(|(state, _)| state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0)
                }
            };
        }
    }

    fn release_slot(&self) {
        let mut state = self.lock();
        state.in_use -= 1;
        drop(state);
        self.available.notify_one();
    }
}

impl InstancePool for BoundedPool {
    fn get(&self, ctx: Option<&Context>) -> Result<Arc<Instance>> {
        let mut state = self.admit(ctx)?;
        if let Some(instance) = state.idle.pop() {
            return Ok(instance);
        }
        state.created += 1;
        let id = state.created;
        drop(state);

        match (self.factory)(id) {
            Ok(instance) => Ok(Arc::new(instance)),
            Err(err) => {
                self.release_slot();
                Err(err)
            }
        }
    }

    fn put(&self, instance: Arc<Instance>) {
        let mut state = self.lock();
        if !state.closed {
            state.idle.push(instance);
        }
        state.in_use = state.in_use.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }

    fn shutdown(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let idle = std::mem::take(&mut state.idle);
        drop(state);
        self.available.notify_all();
        info!(closed = idle.len(), "bounded pool shut down");
    }

    fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            capacity: Some(self.capacity),
            idle: state.idle.len(),
            in_use: state.in_use,
            created: state.created,
        }
    }
}

/// A single instance shared by every caller.
pub struct SharedPool {
    instance: Mutex<Option<Arc<Instance>>>,
}

impl SharedPool {
    /// Create the shared instance right away.
    pub fn new(factory: InstanceFactory) -> Result<Self> {
        let instance = factory(1)?;
        Ok(Self {
            instance: Mutex::new(Some(Arc::new(instance))),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<Instance>>> {
        self.instance.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl InstancePool for SharedPool {
    fn get(&self, _ctx: Option<&Context>) -> Result<Arc<Instance>> {
        self.lock().clone().ok_or(SandboxError::EngineClosed)
    }

    fn put(&self, _instance: Arc<Instance>) {}

    fn shutdown(&self) {
        if self.lock().take().is_some() {
            info!("shared instance shut down");
        }
    }

    fn stats(&self) -> PoolStats {
        let instance = self.lock();
        let in_use = instance
            .as_ref()
            .map_or(0, |instance| Arc::strong_count(instance) - 1);
        PoolStats {
            capacity: None,
            idle: usize::from(instance.is_some() && in_use == 0),
            in_use,
            created: 1,
        }
    }
}
