//! # Async Client Socket
//!
//! The outbound mirror of the server socket: a pool of asockets handed out
//! for non-blocking connects. Connect completion, data, disconnect and
//! send-ok events are forwarded to the user's [`ClientEvents`] with the
//! slot's connection id; a failed connect or a disconnect returns the slot
//! to the free pool.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::{debug, trace};

use super::addr::EndpointAddr;
use super::asocket::{Asocket, AsocketEvents, DataOutcome, DisconnectReason, SendData};
use super::assocket::ConnId;
use super::chain::Chain;
use crate::error::{Error, Result};

/// Parameters for creating an [`Acsocket`].
#[derive(Clone)]
pub struct AcsocketConfig {
    /// Name used in diagnostics.
    pub name: String,
    /// Number of concurrent outbound connections.
    pub pool_size: usize,
    /// Initial receive buffer per connection.
    pub initial_buf: usize,
}

/// Callbacks a client pool delivers to its user; all run on the chain
/// thread.
pub trait ClientEvents {
    /// Outcome of a connect started with [`Acsocket::connect_to`].
    fn on_connect(&self, cli: &Acsocket, conn: ConnId, status: Result<()>) {
        let _ = (cli, conn, status);
    }

    /// Buffered bytes from `conn` are available.
    fn on_data(&self, cli: &Acsocket, conn: ConnId, buf: &[u8]) -> DataOutcome;

    /// `conn` went away and its slot is free again.
    fn on_disconnect(&self, cli: &Acsocket, conn: ConnId, reason: DisconnectReason) {
        let _ = (cli, conn, reason);
    }

    /// A queued buffer for `conn` was fully written.
    fn on_send_ok(&self, cli: &Acsocket, conn: ConnId) {
        let _ = (cli, conn);
    }
}

struct ConnForward {
    client: Weak<Acsocket>,
    slot: ConnId,
}

impl AsocketEvents for ConnForward {
    fn on_connect(&self, _sock: &Asocket, status: Result<()>) {
        if let Some(cli) = self.client.upgrade() {
            if status.is_err() {
                cli.free.borrow_mut().push(self.slot);
            }
            cli.events.on_connect(&cli, self.slot, status);
        }
    }

    fn on_data(&self, _sock: &Asocket, buf: &[u8]) -> DataOutcome {
        match self.client.upgrade() {
            Some(cli) => cli.events.on_data(&cli, self.slot, buf),
            None => DataOutcome::Invalid,
        }
    }

    fn on_disconnect(&self, _sock: &Asocket, reason: DisconnectReason) {
        if let Some(cli) = self.client.upgrade() {
            cli.free.borrow_mut().push(self.slot);
            cli.events.on_disconnect(&cli, self.slot, reason);
        }
    }

    fn on_send_ok(&self, _sock: &Asocket) {
        if let Some(cli) = self.client.upgrade() {
            cli.events.on_send_ok(&cli, self.slot);
        }
    }
}

/// Pool of asockets for outbound connections.
pub struct Acsocket {
    name: String,
    pool: Vec<Rc<Asocket>>,
    free: RefCell<Vec<ConnId>>,
    events: Rc<dyn ClientEvents>,
}

impl Acsocket {
    /// Create the pool and register its asockets in the chain.
    pub fn create(
        chain: &Chain,
        config: AcsocketConfig,
        events: Rc<dyn ClientEvents>,
    ) -> Rc<Acsocket> {
        let client = Rc::new_cyclic(|weak: &Weak<Acsocket>| {
            let mut pool = Vec::with_capacity(config.pool_size);
            for slot in 0..config.pool_size {
                let asock = Asocket::new(
                    chain.controller(),
                    &format!("{}-conn-{}", config.name, slot),
                    config.initial_buf,
                    false,
                );
                asock.set_slot(slot);
                asock.set_events(Rc::new(ConnForward {
                    client: weak.clone(),
                    slot,
                }));
                pool.push(asock);
            }
            Acsocket {
                name: config.name,
                pool,
                free: RefCell::new((0..config.pool_size).rev().collect()),
                events,
            }
        });
        for asock in &client.pool {
            chain.append(asock.clone());
        }
        client
    }

    /// Assign a free slot and start a non-blocking connect to the remote.
    ///
    /// The result arrives through [`ClientEvents::on_connect`]. Fails with
    /// `ReachMaxResources` when every slot is busy; a connect that cannot
    /// even start returns the slot and propagates the error.
    pub fn connect_to(&self, addr: &EndpointAddr, port: u16) -> Result<ConnId> {
        let slot = self
            .free
            .borrow_mut()
            .pop()
            .ok_or(Error::ReachMaxResources)?;
        trace!("acsocket {}: connecting slot {} to {}", self.name, slot, addr);
        match self.pool[slot].begin_connect(addr, port) {
            Ok(()) => Ok(slot),
            Err(e) => {
                debug!("acsocket {}: connect start failed: {}", self.name, e);
                self.free.borrow_mut().push(slot);
                Err(e)
            }
        }
    }

    /// Queue outbound data for `conn`.
    pub fn send(&self, conn: ConnId, data: SendData) -> Result<()> {
        self.asocket(conn)?.send(data)
    }

    /// Close `conn`; the slot returns to the free pool through the
    /// disconnect callback.
    pub fn disconnect(&self, conn: ConnId) -> Result<()> {
        self.asocket(conn)?.disconnect();
        Ok(())
    }

    /// Remote address of `conn`, when connected.
    pub fn remote(&self, conn: ConnId) -> Option<(EndpointAddr, u16)> {
        self.pool.get(conn)?.remote()
    }

    /// Number of currently free connection slots.
    pub fn free_slots(&self) -> usize {
        self.free.borrow().len()
    }

    fn asocket(&self, conn: ConnId) -> Result<&Rc<Asocket>> {
        self.pool
            .get(conn)
            .ok_or(Error::InvalidParam("connection id out of range"))
    }
}
