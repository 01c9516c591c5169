//! # Deferred Timers
//!
//! A utimer is a chain object holding a list of timer items sorted by
//! absolute expiry. Its `pre_select` lowers the chain's block time to the
//! head item's remaining delay; its `post_select` fires every item that has
//! come due, in expiry order. Items are keyed so a caller can cancel all of
//! its outstanding items at once; cancellation runs the item's destroy hook
//! but never its fire hook.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::trace;

use super::chain::{Chain, ChainController, ChainObject, Selector};

type FireFn = Rc<dyn Fn()>;

struct TimerItem {
    expires: Instant,
    key: u64,
    on_fire: FireFn,
    on_destroy: Option<FireFn>,
}

/// A sorted expiry list driven by the chain's block time.
pub struct Utimer {
    name: String,
    items: RefCell<Vec<TimerItem>>,
    controller: ChainController,
}

impl Utimer {
    /// Create a utimer and register it in the chain.
    pub fn new(chain: &Chain, name: &str) -> Rc<Utimer> {
        let timer = Rc::new(Utimer {
            name: name.to_string(),
            items: RefCell::new(Vec::new()),
            controller: chain.controller(),
        });
        chain.append(timer.clone());
        timer
    }

    /// Schedule `on_fire` to run after `delay`. `key` groups items for
    /// [`remove`](Self::remove).
    pub fn add(&self, key: u64, delay: Duration, on_fire: impl Fn() + 'static) {
        self.add_full(key, delay, Rc::new(on_fire), None);
    }

    /// Schedule with a destroy hook, run when the item is cancelled.
    pub fn add_with_destroy(
        &self,
        key: u64,
        delay: Duration,
        on_fire: impl Fn() + 'static,
        on_destroy: impl Fn() + 'static,
    ) {
        self.add_full(key, delay, Rc::new(on_fire), Some(Rc::new(on_destroy)));
    }

    fn add_full(&self, key: u64, delay: Duration, on_fire: FireFn, on_destroy: Option<FireFn>) {
        let item = TimerItem {
            expires: Instant::now() + delay,
            key,
            on_fire,
            on_destroy,
        };
        let mut items = self.items.borrow_mut();
        // Insert after any item with an equal expiry to keep FIFO order.
        let pos = items
            .iter()
            .position(|it| it.expires > item.expires)
            .unwrap_or(items.len());
        trace!("utimer {}: add key {} at slot {}", self.name, key, pos);
        items.insert(pos, item);
        let new_head = pos == 0;
        drop(items);
        // A new head means the chain may be blocked past it.
        if new_head {
            self.controller.wakeup();
        }
    }

    /// Cancel every item with `key`, running destroy hooks but not fire
    /// hooks. Returns the number of items removed.
    pub fn remove(&self, key: u64) -> usize {
        let removed: Vec<TimerItem> = {
            let mut items = self.items.borrow_mut();
            let mut kept = Vec::with_capacity(items.len());
            let mut gone = Vec::new();
            for item in items.drain(..) {
                if item.key == key {
                    gone.push(item);
                } else {
                    kept.push(item);
                }
            }
            *items = kept;
            gone
        };
        let count = removed.len();
        for item in removed {
            if let Some(destroy) = item.on_destroy {
                destroy();
            }
        }
        count
    }

    /// Whether any item with `key` is outstanding.
    pub fn is_scheduled(&self, key: u64) -> bool {
        self.items.borrow().iter().any(|it| it.key == key)
    }
}

impl ChainObject for Utimer {
    fn name(&self) -> &str {
        &self.name
    }

    fn pre_select(&self, sel: &mut Selector) {
        let items = self.items.borrow();
        if let Some(head) = items.first() {
            let remaining = head.expires.saturating_duration_since(Instant::now());
            sel.shrink_block(remaining.as_millis() as u32);
        }
    }

    fn post_select(&self, _nready: i32, _sel: &Selector) {
        let now = Instant::now();
        // Collect due items first; fire hooks may re-arm the timer.
        let due: Vec<TimerItem> = {
            let mut items = self.items.borrow_mut();
            let split = items
                .iter()
                .position(|it| it.expires > now)
                .unwrap_or(items.len());
            items.drain(..split).collect()
        };
        for item in due {
            trace!("utimer {}: fire key {}", self.name, item.key);
            (item.on_fire)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn run_chain_for(chain: &Rc<Chain>, total: Duration) {
        let controller = chain.controller();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(total);
            controller.stop().unwrap();
        });
        chain.run().unwrap();
        stopper.join().unwrap();
    }

    /// Items scheduled at shuffled delays fire in delay order.
    #[test]
    fn test_fire_order_is_sorted() {
        let chain = Chain::new().unwrap();
        let timer = Utimer::new(&chain, "order-test");
        let fired: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(Vec::new()));

        for key in [5u64, 1, 3, 2, 4] {
            let fired = Rc::clone(&fired);
            timer.add(key, Duration::from_millis(key * 20), move || {
                fired.borrow_mut().push(key);
            });
        }

        run_chain_for(&chain, Duration::from_millis(300));
        assert_eq!(*fired.borrow(), vec![1, 2, 3, 4, 5]);
    }

    /// remove cancels all items with the key and runs destroy hooks only.
    #[test]
    fn test_remove_runs_destroy_not_fire() {
        let chain = Chain::new().unwrap();
        let timer = Utimer::new(&chain, "remove-test");
        let fired = Rc::new(Cell::new(0u32));
        let destroyed = Rc::new(Cell::new(0u32));

        for _ in 0..2 {
            let fired = Rc::clone(&fired);
            let destroyed = Rc::clone(&destroyed);
            timer.add_with_destroy(
                7,
                Duration::from_millis(30),
                move || fired.set(fired.get() + 1),
                move || destroyed.set(destroyed.get() + 1),
            );
        }

        assert_eq!(timer.remove(7), 2);
        assert_eq!(destroyed.get(), 2);
        assert!(!timer.is_scheduled(7));

        run_chain_for(&chain, Duration::from_millis(100));
        assert_eq!(fired.get(), 0);
    }

    /// A fire hook may re-arm the timer from inside the callback.
    #[test]
    fn test_rearm_from_fire_hook() {
        let chain = Chain::new().unwrap();
        let timer = Utimer::new(&chain, "rearm-test");
        let count = Rc::new(Cell::new(0u32));

        let timer_for_hook = Rc::clone(&timer);
        let count_for_hook = Rc::clone(&count);
        timer.add(1, Duration::from_millis(20), move || {
            count_for_hook.set(count_for_hook.get() + 1);
            if count_for_hook.get() < 3 {
                let inner_count = Rc::clone(&count_for_hook);
                timer_for_hook.add(1, Duration::from_millis(20), move || {
                    inner_count.set(inner_count.get() + 1);
                });
            }
        });

        run_chain_for(&chain, Duration::from_millis(200));
        assert!(count.get() >= 2);
    }
}
