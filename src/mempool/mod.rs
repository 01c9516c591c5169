//! # Memory Pool Module
//!
//! Two cooperating layers: a buddy [`PageAllocator`] handing out
//! power-of-two page runs, and named [`ObjectCache`]s carving those runs
//! into fixed-size objects. The allocator is process-wide and thread-safe;
//! caches share its lock discipline. Daemons own one allocator instance,
//! created in `main` and passed down explicitly.

pub mod cache;
pub mod page;

pub use cache::{CacheFlags, CacheObj, ObjectCache, MAX_OBJECT_SIZE};
pub use page::{AllocFlags, PageAllocator, PageRun, PoolConfig, MAX_PAGE_ORDER, PAGE_SHIFT, PAGE_SIZE};
