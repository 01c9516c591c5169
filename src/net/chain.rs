//! # The Chain
//!
//! The single-threaded reactor at the center of every daemon. Registered
//! objects participate in two phases per loop iteration: `pre_select`, where
//! an object adds its descriptors to the fd sets and may shrink the block
//! time, and `post_select`, where it reacts to readiness. Objects are
//! visited in insertion order in both phases; that order is the only
//! fairness the chain guarantees.
//!
//! A connected socket pair serves as the wakeup channel: any thread may
//! write a byte through a [`ChainController`] to interrupt the select; a
//! `'S'` byte requests termination. Everything else about the chain (the
//! objects, their callbacks, their timers) is confined to the thread
//! inside [`Chain::run`].

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::socket::RawSock;
use crate::error::Result;

/// Default select block time: 24 hours, in milliseconds.
pub const MAX_BLOCK_MS: u32 = 86_400_000;

/// Byte written to the wakeup channel to request termination.
const STOP_BYTE: u8 = b'S';

/// Byte written to the wakeup channel to interrupt the select.
const WAKE_BYTE: u8 = b'W';

struct FdSet(libc::fd_set);

impl FdSet {
    fn new() -> FdSet {
        let mut set: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe { libc::FD_ZERO(&mut set) };
        FdSet(set)
    }

    fn insert(&mut self, fd: RawFd) {
        unsafe { libc::FD_SET(fd, &mut self.0) };
    }

    fn contains(&self, fd: RawFd) -> bool {
        let set = &self.0 as *const libc::fd_set as *mut libc::fd_set;
        unsafe { libc::FD_ISSET(fd, set) }
    }
}

/// The fd sets and block time built up during `pre_select` and consulted
/// during `post_select`.
pub struct Selector {
    read: FdSet,
    write: FdSet,
    error: FdSet,
    max_fd: RawFd,
    block_ms: u32,
}

impl Selector {
    fn new(block_ms: u32) -> Selector {
        Selector {
            read: FdSet::new(),
            write: FdSet::new(),
            error: FdSet::new(),
            max_fd: -1,
            block_ms,
        }
    }

    /// Register `fd` for readability.
    pub fn add_read(&mut self, fd: RawFd) {
        self.read.insert(fd);
        self.max_fd = self.max_fd.max(fd);
    }

    /// Register `fd` for writability.
    pub fn add_write(&mut self, fd: RawFd) {
        self.write.insert(fd);
        self.max_fd = self.max_fd.max(fd);
    }

    /// Register `fd` for error conditions.
    pub fn add_error(&mut self, fd: RawFd) {
        self.error.insert(fd);
        self.max_fd = self.max_fd.max(fd);
    }

    /// Whether `fd` was reported readable.
    pub fn readable(&self, fd: RawFd) -> bool {
        self.read.contains(fd)
    }

    /// Whether `fd` was reported writable.
    pub fn writable(&self, fd: RawFd) -> bool {
        self.write.contains(fd)
    }

    /// Whether `fd` was reported in error.
    pub fn errored(&self, fd: RawFd) -> bool {
        self.error.contains(fd)
    }

    /// Lower the block time to `ms` if that is sooner. The block time can
    /// never be raised above the chain's default.
    pub fn shrink_block(&mut self, ms: u32) {
        if ms < self.block_ms {
            self.block_ms = ms;
        }
    }

    /// The block time the select will use, in milliseconds.
    pub fn block_ms(&self) -> u32 {
        self.block_ms
    }

    fn select(&mut self) -> i32 {
        let mut tv = libc::timeval {
            tv_sec: (self.block_ms / 1000) as libc::time_t,
            tv_usec: ((self.block_ms % 1000) * 1000) as libc::suseconds_t,
        };
        unsafe {
            libc::select(
                self.max_fd + 1,
                &mut self.read.0,
                &mut self.write.0,
                &mut self.error.0,
                &mut tv,
            )
        }
    }
}

/// An object registered in the chain.
///
/// Both methods run on the chain thread and must not block; objects use
/// interior mutability for their own state.
pub trait ChainObject {
    /// Name used in diagnostics.
    fn name(&self) -> &str {
        "chain-object"
    }

    /// Register descriptors and optionally shrink the block time.
    fn pre_select(&self, sel: &mut Selector) {
        let _ = sel;
    }

    /// React to select results.
    fn post_select(&self, nready: i32, sel: &Selector) {
        let _ = (nready, sel);
    }
}

/// Thread-safe handle for stopping or waking a chain.
#[derive(Clone)]
pub struct ChainController {
    tx: Arc<RawSock>,
}

impl ChainController {
    /// Ask the chain to terminate after the current pass.
    pub fn stop(&self) -> Result<()> {
        self.tx.sendn(&[STOP_BYTE])
    }

    /// Interrupt the select so new registrations or timers take effect.
    pub fn wakeup(&self) {
        if let Err(e) = self.tx.sendn(&[WAKE_BYTE]) {
            warn!("chain wakeup failed: {}", e);
        }
    }
}

/// The reactor: an append-only list of chain objects plus the wakeup
/// channel.
pub struct Chain {
    objects: RefCell<Vec<Rc<dyn ChainObject>>>,
    wakeup_rx: RawSock,
    wakeup_tx: Arc<RawSock>,
    terminate: Cell<bool>,
}

impl Chain {
    /// Create an empty chain with its wakeup socket pair.
    pub fn new() -> Result<Rc<Chain>> {
        let (rx, tx) = RawSock::pair()?;
        rx.set_nonblocking(true)?;
        Ok(Rc::new(Chain {
            objects: RefCell::new(Vec::new()),
            wakeup_rx: rx,
            wakeup_tx: Arc::new(tx),
            terminate: Cell::new(false),
        }))
    }

    /// Append an object at the tail of the chain.
    pub fn append(&self, obj: Rc<dyn ChainObject>) {
        trace!("chain append: {}", obj.name());
        self.objects.borrow_mut().push(obj);
    }

    /// A cloneable, thread-safe stop/wakeup handle.
    pub fn controller(&self) -> ChainController {
        ChainController {
            tx: Arc::clone(&self.wakeup_tx),
        }
    }

    /// Run the loop until a stop is requested.
    ///
    /// Only one thread may be inside `run`; all object callbacks execute
    /// here.
    pub fn run(&self) -> Result<()> {
        debug!("chain starting");
        while !self.terminate.get() {
            let mut sel = Selector::new(MAX_BLOCK_MS);
            sel.add_read(self.wakeup_rx.raw_fd());

            // Objects may be appended during callbacks; iterate a snapshot.
            let objects: Vec<Rc<dyn ChainObject>> = self.objects.borrow().clone();
            for obj in &objects {
                obj.pre_select(&mut sel);
            }

            trace!("chain select, block {} ms", sel.block_ms());
            let mut nready = sel.select();
            if nready < 0 {
                // Interrupted or failed select; skip this pass.
                continue;
            }

            if nready > 0 && sel.readable(self.wakeup_rx.raw_fd()) {
                self.drain_wakeup();
                nready -= 1;
            }

            for obj in &objects {
                obj.post_select(nready, &sel);
            }
        }
        debug!("chain stopped");
        Ok(())
    }

    fn drain_wakeup(&self) {
        let mut buf = [0u8; 100];
        if let Ok(n) = self.wakeup_rx.recv(&mut buf) {
            if buf[..n].contains(&STOP_BYTE) {
                debug!("chain received stop");
                self.terminate.set(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    struct Noop;
    impl ChainObject for Noop {}

    /// A chain with registered no-op objects, stopped from another thread,
    /// exits within one select cycle.
    #[test]
    fn test_stop_from_other_thread() {
        let (ctl_tx, ctl_rx) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            let chain = Chain::new().unwrap();
            for _ in 0..4 {
                chain.append(Rc::new(Noop));
            }
            ctl_tx.send(chain.controller()).unwrap();
            chain.run().unwrap();
        });

        let controller = ctl_rx.recv().unwrap();
        let started = Instant::now();
        controller.stop().unwrap();
        handle.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    struct BlockShrinker;
    impl ChainObject for BlockShrinker {
        fn pre_select(&self, sel: &mut Selector) {
            sel.shrink_block(10);
            // Shrinking never raises the block time.
            sel.shrink_block(50_000_000);
        }
    }

    #[test]
    fn test_block_time_only_shrinks() {
        let mut sel = Selector::new(MAX_BLOCK_MS);
        BlockShrinker.pre_select(&mut sel);
        assert_eq!(sel.block_ms(), 10);
    }

    /// Wakeup interrupts a long select without terminating the chain.
    #[test]
    fn test_wakeup_does_not_stop() {
        let (ctl_tx, ctl_rx) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            let chain = Chain::new().unwrap();
            ctl_tx.send(chain.controller()).unwrap();
            chain.run().unwrap();
        });

        let controller = ctl_rx.recv().unwrap();
        controller.wakeup();
        std::thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        controller.stop().unwrap();
        handle.join().unwrap();
    }
}
