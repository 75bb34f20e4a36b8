//! A reusable heavy-object cache with atomic generation-based invalidation.
//!
//! The pool exists because hydrated scorers are expensive to construct and not necessarily safe
//! to share between threads. Request threads borrow an instance for the duration of one
//! prediction and return it through a scoped guard. When the model downloader installs a new
//! factory, the pool's generation is bumped and every instance created under the old generation
//! is destroyed instead of recycled.
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use crate::{Error, Result};

/// Factory constructing pooled instances. Stored behind an `Arc` so construction can happen
/// outside the pool lock.
pub type PoolFactory<T> = Arc<dyn Fn() -> Result<T> + Send + Sync>;

struct PooledInstance<T> {
    object: T,
    generation: u64,
}

struct PoolState<T> {
    free: Vec<PooledInstance<T>>,
    factory: Option<PoolFactory<T>>,
    generation: u64,
}

/// A thread-safe object pool whose contents are invalidated by swapping the factory.
pub struct VersionedPool<T> {
    state: Mutex<PoolState<T>>,
}

impl<T> VersionedPool<T> {
    /// Create a pool with no factory. [`VersionedPool::get_or_create`] fails with
    /// [`Error::FactoryNotConfigured`] until [`VersionedPool::update_factory`] is called.
    pub fn new() -> VersionedPool<T> {
        VersionedPool {
            state: Mutex::new(PoolState {
                free: Vec::new(),
                factory: None,
                generation: 0,
            }),
        }
    }

    /// Create a pool with an initial factory.
    pub fn with_factory(factory: PoolFactory<T>) -> VersionedPool<T> {
        VersionedPool {
            state: Mutex::new(PoolState {
                free: Vec::new(),
                factory: Some(factory),
                generation: 0,
            }),
        }
    }

    /// Borrow a free instance, constructing one via the current factory on a pool miss.
    ///
    /// Stale instances found in the free list are destroyed, not handed out. Construction runs
    /// outside the pool lock so a slow factory does not stall concurrent borrowers.
    ///
    /// # Errors
    ///
    /// - [`Error::FactoryNotConfigured`] if the pool has no factory.
    /// - Any error returned by the factory itself.
    pub fn get_or_create(&self) -> Result<PoolGuard<'_, T>> {
        let (factory, generation) = {
            let mut state = self
                .state
                .lock()
                .expect("thread holding pool lock should not panic");

            while let Some(instance) = state.free.pop() {
                if instance.generation == state.generation {
                    return Ok(PoolGuard {
                        pool: self,
                        instance: Some(instance),
                    });
                }
                // Stale generation: fall through and destroy the instance.
            }

            let factory = state
                .factory
                .clone()
                .ok_or(Error::FactoryNotConfigured)?;
            (factory, state.generation)
        };

        let object = factory()?;
        Ok(PoolGuard {
            pool: self,
            instance: Some(PooledInstance { object, generation }),
        })
    }

    /// Swap the construction factory, invalidating every pooled instance.
    ///
    /// The generation bump and the free-list purge happen under one lock acquisition: once this
    /// returns, no `get_or_create` call can observe the old generation. In-flight borrowed
    /// instances are unaffected and get destroyed when they are eventually returned.
    pub fn update_factory(&self, factory: PoolFactory<T>) {
        let stale = {
            let mut state = self
                .state
                .lock()
                .expect("thread holding pool lock should not panic");
            state.factory = Some(factory);
            state.generation += 1;
            std::mem::take(&mut state.free)
        };
        // Stale instances are dropped outside the lock.
        drop(stale);
    }

    /// Current factory generation.
    pub fn generation(&self) -> u64 {
        let state = self
            .state
            .lock()
            .expect("thread holding pool lock should not panic");
        state.generation
    }

    /// Number of free instances. Approximate, for diagnostics.
    pub fn free_count(&self) -> usize {
        let state = self
            .state
            .lock()
            .expect("thread holding pool lock should not panic");
        state.free.len()
    }

    fn release(&self, instance: PooledInstance<T>) {
        let mut state = self
            .state
            .lock()
            .expect("thread holding pool lock should not panic");
        if instance.generation == state.generation {
            state.free.push(instance);
        }
        // A stale instance is simply dropped here.
    }
}

impl<T> Default for VersionedPool<T> {
    fn default() -> VersionedPool<T> {
        VersionedPool::new()
    }
}

impl<T> std::fmt::Debug for VersionedPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedPool")
            .field("generation", &self.generation())
            .field("free_count", &self.free_count())
            .finish()
    }
}

/// Scoped borrow of a pooled instance. Returns the instance to the pool on drop, on every exit
/// path.
pub struct PoolGuard<'a, T> {
    pool: &'a VersionedPool<T>,
    instance: Option<PooledInstance<T>>,
}

impl<T> Deref for PoolGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self
            .instance
            .as_ref()
            .expect("pool guard instance is only taken on drop")
            .object
    }
}

impl<T> DerefMut for PoolGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self
            .instance
            .as_mut()
            .expect("pool guard instance is only taken on drop")
            .object
    }
}

impl<T> Drop for PoolGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.pool.release(instance);
        }
    }
}
