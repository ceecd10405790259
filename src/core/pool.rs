//! # Object Pools
//!
//! Reusable scratch objects shared between worker threads. Free objects sit
//! in a lock-free queue; a checked-out object is wrapped in a [`Pooled`]
//! guard that pushes it back when dropped.
//!
//! A [`PoolMode::Fixed`] pool is filled up front and refuses to hand out more
//! than its capacity, which bounds the memory of in-flight tasks. A
//! [`PoolMode::Growable`] pool builds objects on demand and keeps them.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;

use crate::error::PoolError;

/// Sizing policy of an [`ObjectPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// At most this many objects ever exist. Acquiring past that fails.
    Fixed(usize),
    /// Objects are created on demand and kept for reuse.
    Growable,
}

/// A thread-safe pool of reusable scratch objects.
///
/// Worker tasks check out voxel grids, mesher scratch, and mesh output buffers
/// for the duration of one task and hand them back on drop, so the steady
/// state allocates nothing. Returned objects are not cleared; every consumer
/// in this crate fully overwrites what it reads.
pub struct ObjectPool<T> {
    free: SegQueue<T>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    mode: PoolMode,
    created: AtomicUsize,
    checked_out: AtomicUsize,
}

impl<T: Send> ObjectPool<T> {
    /// Creates a pool that builds objects with `factory`. Fixed pools are
    /// filled eagerly.
    pub fn new(mode: PoolMode, factory: impl Fn() -> T + Send + Sync + 'static) -> Arc<Self> {
        let pool = Self {
            free: SegQueue::new(),
            factory: Box::new(factory),
            mode,
            created: AtomicUsize::new(0),
            checked_out: AtomicUsize::new(0),
        };
        if let PoolMode::Fixed(capacity) = mode {
            for _ in 0..capacity {
                pool.free.push((pool.factory)());
            }
            pool.created.store(capacity, Ordering::Relaxed);
        }
        Arc::new(pool)
    }

    /// Checks out an object. The guard returns it to the pool when dropped.
    pub fn acquire(self: &Arc<Self>) -> Result<Pooled<T>, PoolError> {
        let value = match self.free.pop() {
            Some(value) => value,
            None => match self.mode {
                PoolMode::Fixed(capacity) => return Err(PoolError::Exhausted { capacity }),
                PoolMode::Growable => {
                    self.created.fetch_add(1, Ordering::Relaxed);
                    (self.factory)()
                }
            },
        };
        self.checked_out.fetch_add(1, Ordering::Relaxed);
        Ok(Pooled {
            value: Some(value),
            pool: Arc::clone(self),
        })
    }

    /// Objects ever built by this pool.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Objects currently held by guards.
    pub fn checked_out(&self) -> usize {
        self.checked_out.load(Ordering::Relaxed)
    }

    /// Objects waiting in the free list.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    fn release(&self, value: T) {
        self.checked_out.fetch_sub(1, Ordering::Relaxed);
        self.free.push(value);
    }
}

/// RAII guard for an object checked out of an [`ObjectPool`].
pub struct Pooled<T: Send> {
    value: Option<T>,
    pool: Arc<ObjectPool<T>>,
}

impl<T: Send> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `drop` takes the value out.
        match &self.value {
            Some(value) => value,
            None => unreachable!("pooled value accessed after release"),
        }
    }
}

impl<T: Send> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("pooled value accessed after release"),
        }
    }
}

impl<T: Send + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.value).finish()
    }
}

impl<T: Send> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.release(value);
        }
    }
}
