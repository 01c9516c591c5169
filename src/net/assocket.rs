//! # Async Server Socket
//!
//! A listening socket plus a fixed slab of asockets to accept into. Each
//! accepted connection is bound to a free slot and its events are forwarded
//! to the user's [`ServerEvents`] with the slot's connection id; a
//! disconnect returns the slot to the free pool.
//!
//! When every slot is busy the accept is deferred: the pending connection
//! stays in the listen backlog and is picked up as soon as a slot frees,
//! while established connections keep being serviced.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::{debug, trace, warn};

use super::addr::EndpointAddr;
use super::asocket::{Asocket, AsocketEvents, DataOutcome, DisconnectReason, SendData};
use super::chain::{Chain, ChainObject, Selector};
use super::socket::RawSock;
use crate::error::{Error, Result};

/// Connection identifier: the pool slot a connection occupies.
pub type ConnId = usize;

/// Parameters for creating an [`Assocket`].
#[derive(Clone)]
pub struct AssocketConfig {
    /// Name used in diagnostics.
    pub name: String,
    /// Address to listen on.
    pub addr: EndpointAddr,
    /// Port for IPv4 endpoints; ignored for Unix-domain.
    pub port: u16,
    /// Number of concurrent connections served.
    pub pool_size: usize,
    /// Initial receive buffer per connection.
    pub initial_buf: usize,
}

/// Callbacks a server delivers to its user; all run on the chain thread.
pub trait ServerEvents {
    /// A client connected and occupies `conn`.
    fn on_connect(&self, srv: &Assocket, conn: ConnId) {
        let _ = (srv, conn);
    }

    /// Buffered bytes from `conn` are available.
    fn on_data(&self, srv: &Assocket, conn: ConnId, buf: &[u8]) -> DataOutcome;

    /// `conn` went away and its slot is free again.
    fn on_disconnect(&self, srv: &Assocket, conn: ConnId, reason: DisconnectReason) {
        let _ = (srv, conn, reason);
    }

    /// A queued buffer for `conn` was fully written.
    fn on_send_ok(&self, srv: &Assocket, conn: ConnId) {
        let _ = (srv, conn);
    }
}

/// Forwards one asocket's events to the owning server with a slot id.
struct ConnForward {
    server: Weak<Assocket>,
    slot: ConnId,
}

impl AsocketEvents for ConnForward {
    fn on_data(&self, _sock: &Asocket, buf: &[u8]) -> DataOutcome {
        match self.server.upgrade() {
            Some(srv) => srv.events.on_data(&srv, self.slot, buf),
            None => DataOutcome::Invalid,
        }
    }

    fn on_disconnect(&self, _sock: &Asocket, reason: DisconnectReason) {
        if let Some(srv) = self.server.upgrade() {
            srv.events.on_disconnect(&srv, self.slot, reason);
            srv.free.borrow_mut().push(self.slot);
        }
    }

    fn on_send_ok(&self, _sock: &Asocket) {
        if let Some(srv) = self.server.upgrade() {
            srv.events.on_send_ok(&srv, self.slot);
        }
    }
}

/// Listening socket with a slab of per-connection asockets.
pub struct Assocket {
    name: String,
    listener: RawSock,
    pool: Vec<Rc<Asocket>>,
    free: RefCell<Vec<ConnId>>,
    events: Rc<dyn ServerEvents>,
}

impl Assocket {
    /// Bind, listen and register the server and its connection slots in the
    /// chain.
    pub fn create(
        chain: &Chain,
        config: AssocketConfig,
        events: Rc<dyn ServerEvents>,
    ) -> Result<Rc<Assocket>> {
        if config.pool_size == 0 {
            return Err(Error::InvalidParam("server pool size zero"));
        }
        let listener = RawSock::stream(config.addr.domain())?;
        listener.bind(&config.addr, config.port)?;
        listener.listen(config.pool_size as i32)?;
        listener.set_nonblocking(true)?;
        debug!("assocket {}: listening on {}", config.name, config.addr);

        let server = Rc::new_cyclic(|weak: &Weak<Assocket>| {
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
                    server: weak.clone(),
                    slot,
                }));
                pool.push(asock);
            }
            Assocket {
                name: config.name.clone(),
                listener,
                pool,
                free: RefCell::new((0..config.pool_size).rev().collect()),
                events,
            }
        });

        for asock in &server.pool {
            chain.append(asock.clone());
        }
        chain.append(server.clone());
        Ok(server)
    }

    /// Queue outbound data for `conn`.
    pub fn send(&self, conn: ConnId, data: SendData) -> Result<()> {
        self.asocket(conn)?.send(data)
    }

    /// Queue a copy of `buf` for `conn`.
    pub fn send_copy(&self, conn: ConnId, buf: &[u8]) -> Result<()> {
        self.asocket(conn)?.send_copy(buf)
    }

    /// Close `conn`; the slot returns to the free pool through the
    /// disconnect callback.
    pub fn disconnect(&self, conn: ConnId) -> Result<()> {
        self.asocket(conn)?.disconnect();
        Ok(())
    }

    /// Pause on-data delivery for `conn`.
    pub fn pause(&self, conn: ConnId) -> Result<()> {
        self.asocket(conn)?.pause();
        Ok(())
    }

    /// Resume on-data delivery for `conn`.
    pub fn resume(&self, conn: ConnId) -> Result<()> {
        self.asocket(conn)?.resume();
        Ok(())
    }

    /// Remote address of `conn`, when connected.
    pub fn remote(&self, conn: ConnId) -> Option<EndpointAddr> {
        self.pool.get(conn)?.remote().map(|(a, _)| a)
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

impl ChainObject for Assocket {
    fn name(&self) -> &str {
        &self.name
    }

    fn pre_select(&self, sel: &mut Selector) {
        // With the pool exhausted the listener is left out of the set so
        // the chain does not spin on a connection it cannot accept yet.
        if !self.free.borrow().is_empty() {
            sel.add_read(self.listener.raw_fd());
        }
    }

    fn post_select(&self, _nready: i32, sel: &Selector) {
        if !sel.readable(self.listener.raw_fd()) {
            return;
        }
        loop {
            // With no free slot the connection waits in the backlog.
            let slot = match self.free.borrow_mut().pop() {
                Some(slot) => slot,
                None => {
                    trace!("assocket {}: pool exhausted, accept deferred", self.name);
                    return;
                }
            };
            let accepted = self.listener.accept();
            match accepted {
                Ok((sock, remote)) => {
                    debug!("assocket {}: accepted into slot {}", self.name, slot);
                    if self.pool[slot].attach(sock, remote).is_err() {
                        warn!("assocket {}: slot {} unexpectedly busy", self.name, slot);
                        self.free.borrow_mut().push(slot);
                        return;
                    }
                    self.events.on_connect(self, slot);
                }
                Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.free.borrow_mut().push(slot);
                    return;
                }
                Err(e) => {
                    warn!("assocket {}: accept failed: {}", self.name, e);
                    self.free.borrow_mut().push(slot);
                    return;
                }
            }
        }
    }
}
