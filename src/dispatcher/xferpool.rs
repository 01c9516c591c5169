//! # Transfer Object Pool
//!
//! The per-destination send engine of the dispatcher. One pool owns a small
//! outbound connect pool, a utimer for its retry/idle/free timers, and at
//! most one transfer object: a state machine walking
//! INITIAL → CONNECTING → OPERATIVE → IDLE over the life of a connection.
//!
//! One message at a time is bound to the object; the queue in front of the
//! pool (see [`super::xfer`]) binds the next message whenever the previous
//! one completes. A failed connect schedules a retry with exponential
//! backoff (1, 2, 4, 8, 16 seconds, then back to 1) so a dead
//! destination paces the engine but never stops it. An idle connection is
//! closed after a timeout; an object that stays unused in INITIAL is
//! destroyed by a second timeout.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace};

use super::message::DispatcherMsg;
use crate::error::{Error, Result};
use crate::hsm::{EventId, Hsm, StateId, Transition};
use crate::net::{
    Acsocket, AcsocketConfig, Chain, ClientEvents, ConnId, DataOutcome, DisconnectReason,
    EndpointAddr, SendData, Utimer,
};

/// No connection; the object is reusable or about to be reclaimed.
pub const STATE_INITIAL: StateId = 0;
/// Non-blocking connect in flight.
pub const STATE_CONNECTING: StateId = 1;
/// Connected with a send outstanding.
pub const STATE_OPERATIVE: StateId = 2;
/// Connected with nothing to send.
pub const STATE_IDLE: StateId = 3;

/// Connection to the destination is established.
pub const EVENT_CONNECTED: EventId = 0;
/// A message was bound and wants sending.
pub const EVENT_SEND_DATA: EventId = 1;
/// The bound message was fully written.
pub const EVENT_DATA_SENT: EventId = 2;
/// The connection went away.
pub const EVENT_DISCONNECTED: EventId = 3;

/// Number of backoff steps before the delay cycles back to one second.
const CONNECT_RETRY_COUNT: u32 = 5;

/// Connect slots per destination.
const OBJECTS_IN_POOL: usize = 2;

// Timer keys within the pool's utimer.
const KEY_RETRY: u64 = 0;
const KEY_IDLE: u64 = 1;
const KEY_FREE: u64 = 2;

/// Compute the next retry delay and advance the backoff counter.
pub(crate) fn next_retry_delay(backoff: &Cell<u32>) -> Duration {
    let delay = Duration::from_secs(1u64 << backoff.get());
    backoff.set((backoff.get() + 1) % CONNECT_RETRY_COUNT);
    delay
}

/// Completion callback surface of a pool.
pub trait XferPoolEvents {
    /// The bound message was fully written to the destination.
    fn on_msg_sent(&self, msg: DispatcherMsg);
}

/// Parameters for creating an [`XferPool`].
#[derive(Clone)]
pub struct XferPoolConfig {
    /// Name used in diagnostics and timer naming.
    pub name: String,
    /// Destination endpoint.
    pub remote: EndpointAddr,
    /// Destination port; ignored for Unix-domain endpoints.
    pub port: u16,
    /// Receive buffer size for the outbound connection.
    pub buf_size: usize,
    /// How long a connection may sit idle before it is closed.
    pub idle_timeout: Duration,
    /// How long an unused object survives in INITIAL.
    pub free_timeout: Duration,
}

/// The transfer object: one connection lifecycle driven by the state
/// machine.
struct XferObject {
    pool: Weak<XferPool>,
    hsm: RefCell<Hsm<Rc<XferObject>>>,
    backoff: Cell<u32>,
    msg: RefCell<Option<DispatcherMsg>>,
    conn: Cell<Option<ConnId>>,
}

type Ctx = Rc<XferObject>;

fn guard_has_pending(ctx: &Ctx, _event: EventId) -> bool {
    ctx.msg.borrow().is_some()
}

fn guard_no_pending(ctx: &Ctx, _event: EventId) -> bool {
    ctx.msg.borrow().is_none()
}

fn act_start_connect(ctx: &Ctx, _event: EventId) -> Result<()> {
    let pool = ctx.pool.upgrade().ok_or(Error::NotInitialized)?;
    trace!("xferpool {}: starting connect to {}", pool.name, pool.remote);
    match pool.acsocket.connect_to(&pool.remote, pool.port) {
        Ok(_) => Ok(()),
        Err(e) => {
            // Stay in INITIAL; the retry timer reposts the send event.
            debug!("xferpool {}: connect start failed: {}", pool.name, e);
            schedule_retry(ctx, &pool);
            Err(Error::FailConnect)
        }
    }
}

fn act_send_msg(ctx: &Ctx, _event: EventId) -> Result<()> {
    let pool = ctx.pool.upgrade().ok_or(Error::NotInitialized)?;
    let msg = ctx.msg.borrow().clone();
    if let Some(msg) = msg {
        let conn = ctx.conn.get().ok_or(Error::FailSendData)?;
        trace!("xferpool {}: sending msg {}", pool.name, msg.msg_id());
        pool.acsocket.send(conn, SendData::Shared(msg.shared()))?;
    }
    Ok(())
}

fn act_disconnected(ctx: &Ctx, _event: EventId) -> Result<()> {
    ctx.conn.set(None);
    if ctx.msg.borrow().is_some() {
        // The message survives the connection; reconnect and resend.
        if let Some(pool) = ctx.pool.upgrade() {
            debug!("xferpool {}: disconnected with pending msg, retry", pool.name);
            schedule_retry(ctx, &pool);
        }
    }
    Ok(())
}

fn schedule_retry(ctx: &Ctx, pool: &Rc<XferPool>) {
    let delay = next_retry_delay(&ctx.backoff);
    info!(
        "xferpool {}: retrying connect in {} s",
        pool.name,
        delay.as_secs()
    );
    let weak = Rc::downgrade(ctx);
    pool.utimer.add(KEY_RETRY, delay, move || {
        if let Some(obj) = weak.upgrade() {
            obj.process(EVENT_SEND_DATA);
        }
    });
}

fn entry_idle(ctx: &Ctx, _state: StateId, _event: EventId) -> Result<()> {
    let pool = ctx.pool.upgrade().ok_or(Error::NotInitialized)?;
    trace!("xferpool {}: entering idle", pool.name);
    let weak = Rc::downgrade(ctx);
    pool.utimer.add(KEY_IDLE, pool.idle_timeout, move || {
        let obj = match weak.upgrade() {
            Some(obj) => obj,
            None => return,
        };
        if obj.msg.borrow().is_none() {
            if let (Some(pool), Some(conn)) = (obj.pool.upgrade(), obj.conn.get()) {
                info!("xferpool {}: idle timeout, closing connection", pool.name);
                let _ = pool.acsocket.disconnect(conn);
            }
        }
    });
    Ok(())
}

fn exit_idle(ctx: &Ctx, _state: StateId, _event: EventId) -> Result<()> {
    if let Some(pool) = ctx.pool.upgrade() {
        pool.utimer.remove(KEY_IDLE);
    }
    Ok(())
}

fn entry_initial(ctx: &Ctx, _state: StateId, _event: EventId) -> Result<()> {
    let pool = ctx.pool.upgrade().ok_or(Error::NotInitialized)?;
    let weak = Rc::downgrade(ctx);
    pool.utimer.add(KEY_FREE, pool.free_timeout, move || {
        let obj = match weak.upgrade() {
            Some(obj) => obj,
            None => return,
        };
        if obj.msg.borrow().is_none() {
            if let Some(pool) = obj.pool.upgrade() {
                info!("xferpool {}: unused, destroying object", pool.name);
                pool.destroy_object();
            }
        }
    });
    Ok(())
}

fn exit_initial(ctx: &Ctx, _state: StateId, _event: EventId) -> Result<()> {
    if let Some(pool) = ctx.pool.upgrade() {
        pool.utimer.remove(KEY_FREE);
    }
    Ok(())
}

impl XferObject {
    fn create(pool: &Rc<XferPool>) -> Rc<XferObject> {
        debug!("xferpool {}: creating transfer object", pool.name);
        let obj = Rc::new(XferObject {
            pool: Rc::downgrade(pool),
            hsm: RefCell::new(Hsm::new(Vec::new(), STATE_INITIAL)),
            backoff: Cell::new(0),
            msg: RefCell::new(None),
            conn: Cell::new(None),
        });

        let table = vec![
            Transition {
                current: STATE_INITIAL,
                event: EVENT_SEND_DATA,
                guard: None,
                action: Some(act_start_connect),
                next: STATE_CONNECTING,
            },
            Transition {
                current: STATE_CONNECTING,
                event: EVENT_CONNECTED,
                guard: None,
                action: Some(act_send_msg),
                next: STATE_OPERATIVE,
            },
            Transition {
                current: STATE_CONNECTING,
                event: EVENT_DISCONNECTED,
                guard: None,
                action: Some(act_disconnected),
                next: STATE_INITIAL,
            },
            Transition {
                current: STATE_OPERATIVE,
                event: EVENT_DATA_SENT,
                guard: Some(guard_has_pending as crate::hsm::Guard<Ctx>),
                action: Some(act_send_msg),
                next: STATE_OPERATIVE,
            },
            Transition {
                current: STATE_OPERATIVE,
                event: EVENT_DATA_SENT,
                guard: Some(guard_no_pending as crate::hsm::Guard<Ctx>),
                action: None,
                next: STATE_IDLE,
            },
            Transition {
                current: STATE_OPERATIVE,
                event: EVENT_DISCONNECTED,
                guard: None,
                action: Some(act_disconnected),
                next: STATE_INITIAL,
            },
            Transition {
                current: STATE_IDLE,
                event: EVENT_DISCONNECTED,
                guard: None,
                action: Some(act_disconnected),
                next: STATE_INITIAL,
            },
            Transition {
                current: STATE_IDLE,
                event: EVENT_SEND_DATA,
                guard: Some(guard_has_pending as crate::hsm::Guard<Ctx>),
                action: Some(act_send_msg),
                next: STATE_OPERATIVE,
            },
        ];
        let mut hsm = Hsm::new(table, STATE_INITIAL);
        hsm.add_state_callback(STATE_IDLE, Some(entry_idle), Some(exit_idle));
        hsm.add_state_callback(STATE_INITIAL, Some(entry_initial), Some(exit_initial));
        *obj.hsm.borrow_mut() = hsm;
        obj
    }

    fn process(self: &Rc<Self>, event: EventId) {
        let result = self.hsm.borrow_mut().process_event(self, event);
        if let Err(e) = result {
            debug!("xfer object: event {} handler failed: {}", event, e);
        }
    }

    fn state(&self) -> StateId {
        self.hsm.borrow().current_state()
    }
}

/// Forwards connect-pool events into the transfer object's state machine.
struct PoolConnEvents {
    pool: Weak<XferPool>,
}

impl PoolConnEvents {
    fn object(&self) -> Option<Rc<XferObject>> {
        self.pool.upgrade().and_then(|p| p.object.borrow().clone())
    }
}

impl ClientEvents for PoolConnEvents {
    fn on_connect(&self, _cli: &Acsocket, conn: ConnId, status: Result<()>) {
        let obj = match self.object() {
            Some(obj) => obj,
            None => return,
        };
        match status {
            Ok(()) => {
                obj.conn.set(Some(conn));
                obj.process(EVENT_CONNECTED);
            }
            Err(_) => {
                obj.process(EVENT_DISCONNECTED);
            }
        }
    }

    fn on_data(&self, _cli: &Acsocket, _conn: ConnId, buf: &[u8]) -> DataOutcome {
        // Nothing is expected back on a transfer connection.
        trace!("xferpool: unexpected {} bytes from destination", buf.len());
        DataOutcome::Consumed(buf.len())
    }

    fn on_disconnect(&self, _cli: &Acsocket, _conn: ConnId, _reason: DisconnectReason) {
        if let Some(obj) = self.object() {
            obj.process(EVENT_DISCONNECTED);
        }
    }

    fn on_send_ok(&self, _cli: &Acsocket, _conn: ConnId) {
        let (pool, obj) = match (self.pool.upgrade(), self.object()) {
            (Some(pool), Some(obj)) => (pool, obj),
            _ => return,
        };
        // Unbind before notifying: the completion callback may bind the
        // next message right away.
        let msg = obj.msg.borrow_mut().take();
        if let Some(msg) = msg {
            if let Some(events) = pool.events.upgrade() {
                events.on_msg_sent(msg);
            }
            obj.process(EVENT_DATA_SENT);
        }
    }
}

/// Per-destination transfer pool.
pub struct XferPool {
    name: String,
    remote: EndpointAddr,
    port: u16,
    idle_timeout: Duration,
    free_timeout: Duration,
    acsocket: Rc<Acsocket>,
    utimer: Rc<Utimer>,
    object: RefCell<Option<Rc<XferObject>>>,
    events: Weak<dyn XferPoolEvents>,
}

impl XferPool {
    /// Create a pool for one destination, wiring its connect pool and
    /// timers into the chain.
    pub fn create(
        chain: &Chain,
        config: XferPoolConfig,
        events: Weak<dyn XferPoolEvents>,
    ) -> Rc<XferPool> {
        let utimer = Utimer::new(chain, &format!("{}-xfer-pool", config.name));
        Rc::new_cyclic(|weak: &Weak<XferPool>| {
            let forward = Rc::new(PoolConnEvents { pool: weak.clone() });
            let acsocket = Acsocket::create(
                chain,
                AcsocketConfig {
                    name: format!("{}-xfer-object", config.name),
                    pool_size: OBJECTS_IN_POOL,
                    initial_buf: config.buf_size,
                },
                forward,
            );
            XferPool {
                name: config.name,
                remote: config.remote,
                port: config.port,
                idle_timeout: config.idle_timeout,
                free_timeout: config.free_timeout,
                acsocket,
                utimer,
                object: RefCell::new(None),
                events,
            }
        })
    }

    /// Bind `msg` to the transfer object and drive the state machine.
    ///
    /// Fails with `PreviousMsgNotSent` while an earlier message is still
    /// bound. Must be called on the chain thread.
    pub fn send_msg(self: &Rc<Self>, msg: DispatcherMsg) -> Result<()> {
        let obj = {
            let mut slot = self.object.borrow_mut();
            match slot.as_ref() {
                Some(obj) => obj.clone(),
                None => {
                    let obj = XferObject::create(self);
                    *slot = Some(obj.clone());
                    obj
                }
            }
        };
        if obj.msg.borrow().is_some() {
            return Err(Error::PreviousMsgNotSent);
        }
        *obj.msg.borrow_mut() = Some(msg);
        obj.process(EVENT_SEND_DATA);
        Ok(())
    }

    /// Whether a message is currently bound to the transfer object.
    pub fn has_bound_msg(&self) -> bool {
        self.object
            .borrow()
            .as_ref()
            .map_or(false, |obj| obj.msg.borrow().is_some())
    }

    /// Current state of the transfer object, if one exists.
    pub fn object_state(&self) -> Option<StateId> {
        self.object.borrow().as_ref().map(|obj| obj.state())
    }

    /// Whether the idle-connection timer is armed.
    pub fn idle_timer_armed(&self) -> bool {
        self.utimer.is_scheduled(KEY_IDLE)
    }

    /// Destination this pool serves.
    pub fn remote(&self) -> (&EndpointAddr, u16) {
        (&self.remote, self.port)
    }

    fn destroy_object(&self) {
        self.utimer.remove(KEY_RETRY);
        self.utimer.remove(KEY_IDLE);
        self.utimer.remove(KEY_FREE);
        *self.object.borrow_mut() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Five consecutive failures back off 1, 2, 4, 8, 16 seconds; the
    /// sixth wraps back to 1.
    #[test]
    fn test_retry_backoff_sequence() {
        let backoff = Cell::new(0u32);
        let delays: Vec<u64> = (0..6)
            .map(|_| next_retry_delay(&backoff).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 1]);
    }
}
