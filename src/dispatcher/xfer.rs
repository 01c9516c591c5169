//! # Transfer Queue Facade
//!
//! The thread-safe front of the transfer engine. Any thread may enqueue
//! messages, pause, resume or clear the queue; the chain thread binds the
//! head message into the pool from `pre_select` and pops it when the pool
//! reports completion.
//!
//! Messages queue in three priority classes taken from the messaging
//! header: high before mid before low, FIFO within a class. The queue is
//! bounded; an enqueue beyond the cap fails rather than dropping silently.
//! A message bound into the pool survives a disconnect: the pool retries
//! until it is delivered, and only then is the queue entry released.

use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::message::{DispatcherMsg, PriorityClass};
use super::xferpool::{XferPool, XferPoolConfig, XferPoolEvents};
use crate::error::{Error, Result};
use crate::net::{Chain, ChainController, ChainObject, EndpointAddr, Selector};

/// Parameters for creating an [`Xfer`].
#[derive(Clone)]
pub struct XferConfig {
    /// Name used in diagnostics.
    pub name: String,
    /// Destination endpoint.
    pub remote: EndpointAddr,
    /// Destination port; ignored for Unix-domain endpoints.
    pub port: u16,
    /// Largest message expected; sizes the connection's receive buffer.
    pub max_msg_size: usize,
    /// Cap on queued messages.
    pub max_num_msgs: u32,
    /// Idle-connection timeout for the pool.
    pub idle_timeout: Duration,
    /// Unused-object timeout for the pool.
    pub free_timeout: Duration,
}

impl XferConfig {
    /// Config with the default buffer, queue and timeout values.
    pub fn new(name: &str, remote: EndpointAddr, port: u16) -> XferConfig {
        XferConfig {
            name: name.to_string(),
            remote,
            port,
            max_msg_size: crate::defaults::RECV_BUFFER_SIZE,
            max_num_msgs: crate::defaults::MAX_QUEUED_MSGS,
            idle_timeout: crate::defaults::XFER_IDLE_TIMEOUT,
            free_timeout: crate::defaults::XFER_FREE_TIMEOUT,
        }
    }
}

const CLASSES: usize = 3;

fn class_index(class: PriorityClass) -> usize {
    match class {
        PriorityClass::High => 0,
        PriorityClass::Mid => 1,
        PriorityClass::Low => 2,
    }
}

struct MsgQueue {
    classes: [VecDeque<DispatcherMsg>; CLASSES],
    total: u32,
    paused: bool,
    /// Class and handle of the message currently bound into the pool.
    bound: Option<(usize, DispatcherMsg)>,
}

/// Cloneable, thread-safe handle over an [`Xfer`]'s queue.
///
/// This is the only dispatcher surface other threads may touch: enqueue,
/// pause, resume, clear, and the queue length.
#[derive(Clone)]
pub struct XferSender {
    name: String,
    queue: Arc<Mutex<MsgQueue>>,
    controller: ChainController,
    max_msgs: u32,
}

impl XferSender {
    /// Enqueue a message.
    ///
    /// Wakes the chain when the queue was empty. Fails with
    /// `ReachMaxResources` when the queue is full.
    pub fn send(&self, msg: DispatcherMsg) -> Result<()> {
        let was_idle = {
            let mut q = self.queue.lock();
            if q.total >= self.max_msgs {
                return Err(Error::ReachMaxResources);
            }
            let was_idle = q.total == 0;
            let ci = class_index(msg.priority_class());
            trace!("xfer {}: enqueue msg {} class {}", self.name, msg.msg_id(), ci);
            q.classes[ci].push_back(msg);
            q.total += 1;
            was_idle
        };
        if was_idle {
            self.controller.wakeup();
        }
        Ok(())
    }

    /// Stop feeding the pool; queued messages stay put.
    pub fn pause(&self) {
        self.queue.lock().paused = true;
    }

    /// Resume feeding the pool and wake the chain.
    pub fn resume(&self) {
        self.queue.lock().paused = false;
        self.controller.wakeup();
    }

    /// Drop every queued message. A message already bound inside the pool
    /// is unaffected and still delivered.
    pub fn clear(&self) {
        let mut q = self.queue.lock();
        for class in q.classes.iter_mut() {
            class.clear();
        }
        q.total = 0;
    }

    /// Number of queued messages, the bound one included while its entry
    /// is still queued.
    pub fn queued(&self) -> u32 {
        self.queue.lock().total
    }
}

/// Mutex-guarded send queue feeding one [`XferPool`].
pub struct Xfer {
    sender: XferSender,
    pool: RefCell<Option<Rc<XferPool>>>,
}

impl Xfer {
    /// Create the queue and its pool, and register both in the chain.
    pub fn create(chain: &Chain, config: XferConfig) -> Result<Rc<Xfer>> {
        if config.max_msg_size == 0 {
            return Err(Error::InvalidParam("max message size zero"));
        }
        let xfer = Rc::new(Xfer {
            sender: XferSender {
                name: config.name.clone(),
                queue: Arc::new(Mutex::new(MsgQueue {
                    classes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                    total: 0,
                    paused: false,
                    bound: None,
                })),
                controller: chain.controller(),
                max_msgs: config.max_num_msgs,
            },
            pool: RefCell::new(None),
        });
        let xfer_events_rc: Rc<dyn XferPoolEvents> = xfer.clone();
        let events: std::rc::Weak<dyn XferPoolEvents> = Rc::downgrade(&xfer_events_rc);
        let pool = XferPool::create(
            chain,
            XferPoolConfig {
                name: config.name,
                remote: config.remote,
                port: config.port,
                buf_size: config.max_msg_size,
                idle_timeout: config.idle_timeout,
                free_timeout: config.free_timeout,
            },
            events,
        );
        *xfer.pool.borrow_mut() = Some(pool);
        chain.append(xfer.clone());
        Ok(xfer)
    }

    /// A cloneable handle for use from other threads.
    pub fn sender(&self) -> XferSender {
        self.sender.clone()
    }

    /// Enqueue a message; see [`XferSender::send`].
    pub fn send(&self, msg: DispatcherMsg) -> Result<()> {
        self.sender.send(msg)
    }

    /// Stop feeding the pool; queued messages stay put.
    pub fn pause(&self) {
        self.sender.pause();
    }

    /// Resume feeding the pool and wake the chain.
    pub fn resume(&self) {
        self.sender.resume();
    }

    /// Drop every queued message; see [`XferSender::clear`].
    pub fn clear(&self) {
        self.sender.clear();
    }

    /// Number of queued messages.
    pub fn queued(&self) -> u32 {
        self.sender.queued()
    }

    /// The pool this queue feeds. Chain thread only.
    pub fn pool(&self) -> Rc<XferPool> {
        self.pool
            .borrow()
            .as_ref()
            .expect("pool wired at create")
            .clone()
    }

    /// Bind the head message into the pool, if allowed.
    fn bind_next(&self) {
        let pool = match self.pool.borrow().as_ref() {
            Some(pool) => pool.clone(),
            None => return,
        };
        let msg = {
            let mut q = self.sender.queue.lock();
            if q.paused || q.bound.is_some() {
                return;
            }
            let picked = q
                .classes
                .iter()
                .enumerate()
                .find_map(|(ci, class)| class.front().map(|m| (ci, m.clone())));
            match picked {
                Some((ci, msg)) => {
                    q.bound = Some((ci, msg.clone()));
                    msg
                }
                None => return,
            }
        };
        if let Err(e) = pool.send_msg(msg) {
            debug!("xfer {}: bind failed: {}", self.sender.name, e);
            self.sender.queue.lock().bound = None;
        }
    }
}

impl XferPoolEvents for Xfer {
    fn on_msg_sent(&self, msg: DispatcherMsg) {
        trace!("xfer {}: msg {} sent", self.sender.name, msg.msg_id());
        {
            let mut q = self.sender.queue.lock();
            if let Some((ci, bound)) = q.bound.take() {
                // clear() may have dropped the entry; pop only the exact
                // message that was bound.
                let head_matches = q.classes[ci]
                    .front()
                    .map_or(false, |head| head.ptr_eq(&bound));
                if head_matches {
                    q.classes[ci].pop_front();
                    q.total -= 1;
                }
            }
        }
        drop(msg);
        self.bind_next();
    }
}

impl ChainObject for Xfer {
    fn name(&self) -> &str {
        &self.sender.name
    }

    fn pre_select(&self, _sel: &mut Selector) {
        self.bind_next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::message::{init_header, HEADER_SIZE, PRIO_HIGH, PRIO_LOW, PRIO_MID};

    fn msg(id: u32, prio: u8) -> DispatcherMsg {
        let mut buf = vec![0u8; HEADER_SIZE];
        init_header(&mut buf, id, prio, 0).unwrap();
        DispatcherMsg::create(&buf).unwrap()
    }

    fn test_xfer() -> Rc<Xfer> {
        let chain = Chain::new().unwrap();
        let mut config = XferConfig::new("test", EndpointAddr::uds("/tmp/xfer_unit_test"), 0);
        config.max_num_msgs = 4;
        Xfer::create(&chain, config).unwrap()
    }

    #[test]
    fn test_queue_caps_at_max() {
        let xfer = test_xfer();
        for i in 0..4 {
            xfer.send(msg(i, PRIO_LOW)).unwrap();
        }
        assert!(matches!(
            xfer.send(msg(99, PRIO_LOW)),
            Err(Error::ReachMaxResources)
        ));
        assert_eq!(xfer.queued(), 4);
    }

    #[test]
    fn test_clear_empties_queue() {
        let xfer = test_xfer();
        xfer.send(msg(1, PRIO_LOW)).unwrap();
        xfer.send(msg(2, PRIO_HIGH)).unwrap();
        xfer.clear();
        assert_eq!(xfer.queued(), 0);
    }

    /// Enqueued refcounts: the queue holds the only handle after send.
    #[test]
    fn test_queue_owns_single_handle() {
        let xfer = test_xfer();
        let m = msg(1, PRIO_MID);
        assert_eq!(m.ref_count(), 1);
        xfer.send(m.clone()).unwrap();
        assert_eq!(m.ref_count(), 2);
        drop(m);
        xfer.clear();
    }

    #[test]
    fn test_priority_classes_order() {
        let xfer = test_xfer();
        xfer.send(msg(1, PRIO_LOW)).unwrap();
        xfer.send(msg(2, PRIO_HIGH)).unwrap();
        let q = xfer.sender.queue.lock();
        assert_eq!(q.classes[0].front().unwrap().msg_id(), 2);
        assert_eq!(q.classes[2].front().unwrap().msg_id(), 1);
    }
}
