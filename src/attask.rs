//! # At-Task Scheduler
//!
//! A standalone container of timed tasks for components that run their own
//! wait loop instead of a chain: the owner calls [`Attask::check`] each
//! pass, due tasks fire in expiry order, and the returned block time tells
//! the owner how long it may sleep before the next task comes due.
//!
//! This is the loop-less sibling of the utimer: same sorted expiry list
//! and keyed cancellation, but driven by the caller rather than by a
//! select.

use std::time::{Duration, Instant};
use tracing::trace;

use crate::error::{Error, Result};

/// Block time suggested when no task is scheduled.
pub const DEFAULT_BLOCK: Duration = Duration::from_secs(10);

type TaskFn = Box<dyn FnMut()>;
type DestroyFn = Box<dyn FnOnce()>;

struct TaskItem {
    expires: Instant,
    key: u64,
    on_fire: TaskFn,
    on_destroy: Option<DestroyFn>,
}

/// Task container and scheduler.
pub struct Attask {
    items: Vec<TaskItem>,
}

impl Attask {
    /// Create an empty scheduler.
    pub fn new() -> Attask {
        Attask { items: Vec::new() }
    }

    /// Schedule `on_fire` to run after `delay`. `key` groups items for
    /// [`remove`](Self::remove).
    pub fn add(&mut self, key: u64, delay: Duration, on_fire: impl FnMut() + 'static) {
        self.add_full(key, delay, Box::new(on_fire), None);
    }

    /// Schedule with a destroy hook, run when the item is cancelled or the
    /// scheduler is dropped without the task firing.
    pub fn add_with_destroy(
        &mut self,
        key: u64,
        delay: Duration,
        on_fire: impl FnMut() + 'static,
        on_destroy: impl FnOnce() + 'static,
    ) {
        self.add_full(key, delay, Box::new(on_fire), Some(Box::new(on_destroy)));
    }

    fn add_full(&mut self, key: u64, delay: Duration, on_fire: TaskFn, on_destroy: Option<DestroyFn>) {
        let item = TaskItem {
            expires: Instant::now() + delay,
            key,
            on_fire,
            on_destroy,
        };
        // Insert after any item with an equal expiry to keep FIFO order.
        let pos = self
            .items
            .iter()
            .position(|it| it.expires > item.expires)
            .unwrap_or(self.items.len());
        self.items.insert(pos, item);
    }

    /// Fire every due task, in expiry order, and return how long the
    /// caller may block before the next task comes due.
    pub fn check(&mut self) -> Duration {
        let now = Instant::now();
        let split = self
            .items
            .iter()
            .position(|it| it.expires > now)
            .unwrap_or(self.items.len());
        let due: Vec<TaskItem> = self.items.drain(..split).collect();
        for mut item in due {
            trace!("attask: fire key {}", item.key);
            (item.on_fire)();
            if let Some(destroy) = item.on_destroy.take() {
                destroy();
            }
        }
        match self.items.first() {
            Some(head) => head.expires.saturating_duration_since(now),
            None => DEFAULT_BLOCK,
        }
    }

    /// Cancel every task with `key`, running destroy hooks but not fire
    /// hooks. Fails when no task carries the key.
    pub fn remove(&mut self, key: u64) -> Result<usize> {
        let mut kept = Vec::with_capacity(self.items.len());
        let mut removed = Vec::new();
        for item in self.items.drain(..) {
            if item.key == key {
                removed.push(item);
            } else {
                kept.push(item);
            }
        }
        self.items = kept;
        if removed.is_empty() {
            return Err(Error::InvalidParam("no task with that key"));
        }
        let count = removed.len();
        for mut item in removed {
            if let Some(destroy) = item.on_destroy.take() {
                destroy();
            }
        }
        Ok(count)
    }

    /// Number of scheduled tasks.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether any task is scheduled.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Default for Attask {
    fn default() -> Self {
        Attask::new()
    }
}

impl Drop for Attask {
    fn drop(&mut self) {
        // Flush without firing; destroy hooks still run.
        for item in self.items.drain(..) {
            if let Some(destroy) = item.on_destroy {
                destroy();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn test_due_tasks_fire_in_order() {
        let mut attask = Attask::new();
        let fired: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(Vec::new()));
        for key in [3u64, 1, 2] {
            let fired = Rc::clone(&fired);
            attask.add(key, Duration::from_millis(key * 10), move || {
                fired.borrow_mut().push(key);
            });
        }
        std::thread::sleep(Duration::from_millis(40));
        let block = attask.check();
        assert_eq!(*fired.borrow(), vec![1, 2, 3]);
        assert!(attask.is_empty());
        assert_eq!(block, DEFAULT_BLOCK);
    }

    #[test]
    fn test_block_time_tracks_head() {
        let mut attask = Attask::new();
        attask.add(1, Duration::from_secs(3), || {});
        let block = attask.check();
        assert!(block <= Duration::from_secs(3));
        assert!(block > Duration::from_secs(2));
        assert_eq!(attask.len(), 1);
    }

    #[test]
    fn test_remove_runs_destroy_not_fire() {
        let mut attask = Attask::new();
        let fired = Rc::new(Cell::new(false));
        let destroyed = Rc::new(Cell::new(false));
        {
            let fired = Rc::clone(&fired);
            let destroyed = Rc::clone(&destroyed);
            attask.add_with_destroy(
                9,
                Duration::from_millis(1),
                move || fired.set(true),
                move || destroyed.set(true),
            );
        }
        assert_eq!(attask.remove(9).unwrap(), 1);
        assert!(destroyed.get());
        assert!(attask.remove(9).is_err());

        std::thread::sleep(Duration::from_millis(5));
        attask.check();
        assert!(!fired.get());
    }
}
