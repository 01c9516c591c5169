//! # Resource Pool
//!
//! A thread-safe pool of homogeneous resources created on demand through a
//! factory. The pool keeps at least its minimum count of resources cached
//! across uses and never lets more than its maximum exist at once.
//! Resources above the minimum are "part-time": an immediate-release pool
//! destroys them as soon as they come back, otherwise they linger until a
//! reap pass.

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Creates and destroys the pooled resources.
///
/// `create` must not block; a blocking factory would stall every other
/// thread taking from the pool.
pub trait ResourceFactory<R> {
    /// Produce one resource.
    fn create(&self) -> Result<R>;

    /// Dispose of one resource. The default just drops it.
    fn destroy(&self, resource: R) {
        drop(resource);
    }
}

/// Parameters for creating a [`ResourcePool`].
pub struct ResourcePoolConfig {
    /// Pool name, used in diagnostics.
    pub name: String,
    /// Number of resources kept cached across uses.
    pub min_resources: usize,
    /// Number of resources allowed to exist at once.
    pub max_resources: usize,
    /// Destroy part-time resources on release instead of caching them.
    pub immediate_release: bool,
}

struct PoolState<R> {
    free: Vec<R>,
    /// Resources in existence, free and in use.
    total: usize,
}

/// Bounded pool of resources built by a factory.
pub struct ResourcePool<R, F: ResourceFactory<R>> {
    name: String,
    min_resources: usize,
    max_resources: usize,
    immediate_release: bool,
    factory: F,
    state: Mutex<PoolState<R>>,
}

impl<R, F: ResourceFactory<R>> ResourcePool<R, F> {
    /// Create an empty pool; resources are only built on demand.
    pub fn new(config: ResourcePoolConfig, factory: F) -> Result<ResourcePool<R, F>> {
        if config.max_resources == 0 || config.min_resources > config.max_resources {
            return Err(Error::InvalidParam("resource pool bounds"));
        }
        Ok(ResourcePool {
            name: config.name,
            min_resources: config.min_resources,
            max_resources: config.max_resources,
            immediate_release: config.immediate_release,
            factory,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                total: 0,
            }),
        })
    }

    /// Take a resource, reusing a cached one or creating a new one.
    ///
    /// Fails with `ReachMaxResources` when every allowed resource is in
    /// use.
    pub fn get(&self) -> Result<R> {
        {
            let mut state = self.state.lock();
            if let Some(resource) = state.free.pop() {
                trace!("respool {}: reusing cached resource", self.name);
                return Ok(resource);
            }
            if state.total >= self.max_resources {
                return Err(Error::ReachMaxResources);
            }
            state.total += 1;
        }
        // Create outside the lock; the factory may be slow even when it
        // does not block.
        match self.factory.create() {
            Ok(resource) => {
                debug!("respool {}: created resource", self.name);
                Ok(resource)
            }
            Err(e) => {
                self.state.lock().total -= 1;
                Err(e)
            }
        }
    }

    /// Return a resource to the pool.
    ///
    /// A part-time resource (above the minimum) is destroyed right away
    /// when the pool is immediate-release; otherwise it is cached until a
    /// [`reap`](Self::reap).
    pub fn put(&self, resource: R) {
        {
            let mut state = self.state.lock();
            if !(self.immediate_release && state.total > self.min_resources) {
                state.free.push(resource);
                return;
            }
            state.total -= 1;
        }
        trace!("respool {}: releasing part-time resource", self.name);
        self.factory.destroy(resource);
    }

    /// Destroy cached resources beyond the minimum. Returns how many were
    /// destroyed.
    pub fn reap(&self) -> usize {
        let victims = {
            let mut state = self.state.lock();
            let mut victims = Vec::new();
            while state.total > self.min_resources && !state.free.is_empty() {
                if let Some(resource) = state.free.pop() {
                    state.total -= 1;
                    victims.push(resource);
                }
            }
            victims
        };
        let count = victims.len();
        if count > 0 {
            debug!("respool {}: reaped {} resources", self.name, count);
        }
        for resource in victims {
            self.factory.destroy(resource);
        }
        count
    }

    /// Resources currently in existence, free and in use.
    pub fn total(&self) -> usize {
        self.state.lock().total
    }

    /// Resources currently cached and free.
    pub fn free(&self) -> usize {
        self.state.lock().free.len()
    }
}

impl<R, F: ResourceFactory<R>> Drop for ResourcePool<R, F> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for resource in state.free.drain(..) {
            self.factory.destroy(resource);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        created: Arc<AtomicUsize>,
        destroyed: Arc<AtomicUsize>,
    }

    impl ResourceFactory<usize> for Counting {
        fn create(&self) -> Result<usize> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        fn destroy(&self, _resource: usize) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(min: usize, max: usize, immediate: bool) -> (ResourcePool<usize, Counting>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let pool = ResourcePool::new(
            ResourcePoolConfig {
                name: "test".to_string(),
                min_resources: min,
                max_resources: max,
                immediate_release: immediate,
            },
            Counting {
                created: Arc::clone(&created),
                destroyed: Arc::clone(&destroyed),
            },
        )
        .unwrap();
        (pool, created, destroyed)
    }

    #[test]
    fn test_get_caps_at_max() {
        let (pool, created, _) = pool(1, 2, false);
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert!(matches!(pool.get(), Err(Error::ReachMaxResources)));
        assert_eq!(created.load(Ordering::SeqCst), 2);
        pool.put(a);
        pool.put(b);
        assert_eq!(pool.free(), 2);
    }

    #[test]
    fn test_put_reuses_cached() {
        let (pool, created, _) = pool(1, 4, false);
        let a = pool.get().unwrap();
        pool.put(a);
        let _b = pool.get().unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_immediate_release_destroys_parttime() {
        let (pool, _, destroyed) = pool(1, 4, true);
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        pool.put(a);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        // Back at the minimum; the last resource is cached.
        pool.put(b);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.free(), 1);
    }

    #[test]
    fn test_reap_keeps_minimum() {
        let (pool, _, destroyed) = pool(1, 4, false);
        let resources: Vec<usize> = (0..4).map(|_| pool.get().unwrap()).collect();
        for resource in resources {
            pool.put(resource);
        }
        assert_eq!(pool.reap(), 3);
        assert_eq!(destroyed.load(Ordering::SeqCst), 3);
        assert_eq!(pool.total(), 1);
        assert_eq!(pool.reap(), 0);
    }

    #[test]
    fn test_bad_bounds_rejected() {
        let created = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        assert!(ResourcePool::new(
            ResourcePoolConfig {
                name: "bad".to_string(),
                min_resources: 5,
                max_resources: 2,
                immediate_release: false,
            },
            Counting { created, destroyed },
        )
        .is_err());
    }
}
