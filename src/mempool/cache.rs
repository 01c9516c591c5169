//! Named fixed-size object caches backed by the page allocator.
//!
//! A cache carves page runs ("slabs") into equal object slots and tracks
//! slot occupancy per slab. Objects are addressed by `CacheObj` tokens; the
//! backing bytes are reached through the `with`/`with_mut` accessors, which
//! validate the token first. Freeing a token twice, or a token the cache
//! never produced, panics.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error};

use super::page::{AllocFlags, PageAllocator, PageRun, PAGE_SIZE};
use crate::error::{Error, Result};

/// Maximum object size a cache may be created with.
pub const MAX_OBJECT_SIZE: usize = 1 << 20;

/// Byte written over freed slots when debug-free checking is on.
const POISON_BYTE: u8 = 0x5A;

/// Behavior flags fixed at cache creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheFlags {
    /// Zero every object on allocation.
    pub zero: bool,
    /// Keep empty slabs instead of returning them to the page layer.
    pub no_reap: bool,
    /// Never allocate additional slabs.
    pub no_grow: bool,
    /// Poison freed slots and verify the poison on reuse.
    pub debug_free: bool,
    /// Block in the page layer when no pages are available.
    pub wait: bool,
}

/// Token naming one allocated object in a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheObj {
    slab: u64,
    slot: usize,
}

struct Slab {
    run: PageRun,
    used: Vec<bool>,
    free_count: usize,
}

struct CacheInner {
    slabs: BTreeMap<u64, Slab>,
    next_slab_id: u64,
}

/// A named allocator of fixed-size objects.
pub struct ObjectCache {
    name: String,
    obj_size: usize,
    slab_order: u32,
    objs_per_slab: usize,
    flags: CacheFlags,
    pages: Arc<PageAllocator>,
    inner: Mutex<CacheInner>,
}

impl ObjectCache {
    /// Create a cache of `obj_size`-byte objects on top of `pages`.
    pub fn new(
        pages: Arc<PageAllocator>,
        name: &str,
        obj_size: usize,
        flags: CacheFlags,
    ) -> Result<ObjectCache> {
        if obj_size == 0 || obj_size > MAX_OBJECT_SIZE {
            return Err(Error::InvalidParam("cache object size out of range"));
        }
        // Smallest run that fits at least one object.
        let mut slab_order = 0u32;
        while (PAGE_SIZE << slab_order) < obj_size {
            slab_order += 1;
        }
        if slab_order > pages.pool_order() {
            return Err(Error::InvalidParam("cache object size above pool size"));
        }
        let objs_per_slab = (PAGE_SIZE << slab_order) / obj_size;
        debug!(
            "creating cache {}: obj size {}, slab order {}, {} objs/slab",
            name, obj_size, slab_order, objs_per_slab
        );
        Ok(ObjectCache {
            name: name.to_string(),
            obj_size,
            slab_order,
            objs_per_slab,
            flags,
            pages,
            inner: Mutex::new(CacheInner {
                slabs: BTreeMap::new(),
                next_slab_id: 0,
            }),
        })
    }

    /// Cache name, as given at creation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Object size in bytes.
    pub fn obj_size(&self) -> usize {
        self.obj_size
    }

    /// Allocate one object.
    pub fn alloc(&self) -> Result<CacheObj> {
        let mut guard = self.inner.lock();
        let found = guard
            .slabs
            .iter_mut()
            .find(|(_, slab)| slab.free_count > 0)
            .map(|(&id, slab)| {
                let slot = slab
                    .used
                    .iter()
                    .position(|&u| !u)
                    .expect("free_count positive implies a free slot");
                slab.used[slot] = true;
                slab.free_count -= 1;
                (CacheObj { slab: id, slot }, slab.run)
            });

        let (obj, run) = match found {
            Some(hit) => hit,
            None => {
                if self.flags.no_grow {
                    return Err(Error::OutOfMemory);
                }
                // Grow outside the cache lock; a page-layer WAIT must not
                // prevent other threads from freeing into this cache.
                drop(guard);
                let run = self.pages.alloc(
                    self.slab_order,
                    AllocFlags {
                        wait: self.flags.wait,
                        zero: false,
                    },
                )?;
                let mut used = vec![false; self.objs_per_slab];
                used[0] = true;
                let mut guard = self.inner.lock();
                let id = guard.next_slab_id;
                guard.next_slab_id += 1;
                guard.slabs.insert(
                    id,
                    Slab {
                        run,
                        used,
                        free_count: self.objs_per_slab - 1,
                    },
                );
                (CacheObj { slab: id, slot: 0 }, run)
            }
        };

        if self.flags.zero {
            let off = obj.slot * self.obj_size;
            self.pages
                .with_mut(run, |mem| mem[off..off + self.obj_size].fill(0));
        }
        Ok(obj)
    }

    /// Free one object back to the cache.
    ///
    /// Panics on a token the cache never handed out, or one already freed.
    pub fn free(&self, obj: CacheObj) {
        let mut guard = self.inner.lock();
        let slab = guard.slabs.get_mut(&obj.slab).unwrap_or_else(|| {
            panic!("cache {}: free of unallocated object {:?}", self.name, obj)
        });
        if obj.slot >= slab.used.len() || !slab.used[obj.slot] {
            panic!("cache {}: double free of object {:?}", self.name, obj);
        }
        slab.used[obj.slot] = false;
        slab.free_count += 1;
        if self.flags.debug_free {
            let run = slab.run;
            let off = obj.slot * self.obj_size;
            let size = self.obj_size;
            drop(guard);
            self.pages
                .with_mut(run, |mem| mem[off..off + size].fill(POISON_BYTE));
        }
    }

    /// Run `f` over an object's bytes, immutably.
    pub fn with<R>(&self, obj: CacheObj, f: impl FnOnce(&[u8]) -> R) -> R {
        self.with_mut(obj, |mem| f(mem))
    }

    /// Run `f` over an object's bytes.
    ///
    /// Panics if the token does not name a live object.
    pub fn with_mut<R>(&self, obj: CacheObj, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let guard = self.inner.lock();
        let slab = guard.slabs.get(&obj.slab).unwrap_or_else(|| {
            panic!("cache {}: access of unallocated object {:?}", self.name, obj)
        });
        if obj.slot >= slab.used.len() || !slab.used[obj.slot] {
            panic!("cache {}: access of freed object {:?}", self.name, obj);
        }
        let run = slab.run;
        let off = obj.slot * self.obj_size;
        let size = self.obj_size;
        drop(guard);
        self.pages.with_mut(run, |mem| f(&mut mem[off..off + size]))
    }

    /// Release fully empty slabs back to the page layer.
    ///
    /// A no-reap cache keeps its slabs; the call is then a no-op. Returns
    /// the number of slabs released.
    pub fn reap(&self) -> usize {
        if self.flags.no_reap {
            return 0;
        }
        let mut guard = self.inner.lock();
        let empty: Vec<u64> = guard
            .slabs
            .iter()
            .filter(|(_, s)| s.free_count == self.objs_per_slab)
            .map(|(&id, _)| id)
            .collect();
        let mut runs = Vec::with_capacity(empty.len());
        for id in &empty {
            if let Some(slab) = guard.slabs.remove(id) {
                runs.push(slab.run);
            }
        }
        drop(guard);
        let count = runs.len();
        for run in runs {
            self.pages.free(run);
        }
        count
    }

    /// Number of live objects.
    pub fn active_objects(&self) -> usize {
        let guard = self.inner.lock();
        guard
            .slabs
            .values()
            .map(|s| self.objs_per_slab - s.free_count)
            .sum()
    }

    /// Number of slabs currently held.
    pub fn slab_count(&self) -> usize {
        self.inner.lock().slabs.len()
    }
}

impl Drop for ObjectCache {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let leaked: usize = inner
            .slabs
            .values()
            .map(|s| self.objs_per_slab - s.free_count)
            .sum();
        if leaked > 0 {
            error!(
                "cache {}: destroyed with {} objects still allocated",
                self.name, leaked
            );
        }
        for slab in inner.slabs.values() {
            self.pages.free(slab.run);
        }
    }
}
