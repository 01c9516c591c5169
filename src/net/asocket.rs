//! # Async Socket
//!
//! A chain object owning one connection: a receive buffer the user consumes
//! through a callback, and a pending-send queue with explicit buffer
//! ownership. The asocket registers its descriptor for reading (unless
//! paused or configured read-less), for writing while sends are pending or
//! a connect is outstanding, and always for errors.
//!
//! ## Data Delivery
//!
//! Received bytes accumulate in the buffer, which grows by doubling up to a
//! hard cap of sixteen times its initial size. The on-data callback sees
//! the whole buffered region and reports how much it consumed; unconsumed
//! bytes stay at the front of the buffer for the next delivery. Returning
//! [`DataOutcome::Invalid`] discards the buffer wholesale, the recovery
//! path for protocol corruption. A paused asocket buffers silently and
//! delivers nothing until resumed.
//!
//! ## Send Ownership
//!
//! [`SendData::Owned`] hands the buffer to the asocket, which drops it once
//! written. [`SendData::Shared`] keeps the bytes behind a shared handle the
//! caller must leave untouched until the send-ok callback. Use
//! [`Asocket::send_copy`] to have the bytes copied up front.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, trace};

use super::addr::EndpointAddr;
use super::chain::{ChainController, ChainObject, Selector};
use super::socket::RawSock;
use crate::error::{Error, Result};

/// Growth cap: the receive buffer never exceeds this multiple of its
/// initial size.
pub const RECV_BUFFER_GROWTH_CAP: usize = 16;

/// What the on-data callback did with the buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutcome {
    /// `n` bytes were consumed; the rest stays buffered.
    Consumed(usize),
    /// Nothing usable yet; keep everything until more bytes arrive.
    NeedMore,
    /// The bytes cannot be valid; discard the whole buffer.
    Invalid,
}

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the connection.
    PeerClosed,
    /// A socket error surfaced.
    Error(io::ErrorKind),
    /// This side asked for the disconnect.
    Local,
}

/// Connection state of an asocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockState {
    /// No socket bound; the slot is reusable.
    Free,
    /// Non-blocking connect in flight.
    Connecting,
    /// Established.
    Connected,
    /// Peer half-closed; flushing pending sends before closing.
    Draining,
}

/// An outbound buffer with its ownership mode.
pub enum SendData {
    /// The asocket owns the bytes and drops them when sent.
    Owned(Vec<u8>),
    /// The caller retains a handle and must not touch the bytes until the
    /// send-ok callback.
    Shared(Arc<Vec<u8>>),
}

impl SendData {
    fn as_bytes(&self) -> &[u8] {
        match self {
            SendData::Owned(v) => v,
            SendData::Shared(v) => v,
        }
    }
}

/// Callbacks an asocket delivers; all run on the chain thread.
pub trait AsocketEvents {
    /// Result of an outbound connect.
    fn on_connect(&self, sock: &Asocket, status: Result<()>) {
        let _ = (sock, status);
    }

    /// Buffered bytes are available.
    fn on_data(&self, sock: &Asocket, buf: &[u8]) -> DataOutcome;

    /// The connection went away; the asocket is already reset.
    fn on_disconnect(&self, sock: &Asocket, reason: DisconnectReason) {
        let _ = (sock, reason);
    }

    /// One queued buffer was fully written.
    fn on_send_ok(&self, sock: &Asocket) {
        let _ = sock;
    }
}

struct RecvBuf {
    buf: Vec<u8>,
    len: usize,
}

struct PendingSend {
    data: SendData,
    off: usize,
}

/// Per-connection buffered I/O object registered in a chain.
pub struct Asocket {
    name: String,
    controller: ChainController,
    sock: RefCell<Option<RawSock>>,
    state: Cell<SockState>,
    recv: RefCell<RecvBuf>,
    initial_buf: usize,
    max_buf: usize,
    pending: RefCell<VecDeque<PendingSend>>,
    paused: Cell<bool>,
    no_read: bool,
    events: RefCell<Option<Rc<dyn AsocketEvents>>>,
    remote: RefCell<Option<(EndpointAddr, u16)>>,
    slot: Cell<usize>,
}

impl Asocket {
    /// Create an unbound asocket. The creator is responsible for appending
    /// it to the chain.
    pub fn new(controller: ChainController, name: &str, initial_buf: usize, no_read: bool) -> Rc<Asocket> {
        Rc::new(Asocket {
            name: name.to_string(),
            controller,
            sock: RefCell::new(None),
            state: Cell::new(SockState::Free),
            recv: RefCell::new(RecvBuf {
                buf: Vec::new(),
                len: 0,
            }),
            initial_buf,
            max_buf: initial_buf * RECV_BUFFER_GROWTH_CAP,
            pending: RefCell::new(VecDeque::new()),
            paused: Cell::new(false),
            no_read,
            events: RefCell::new(None),
            remote: RefCell::new(None),
            slot: Cell::new(0),
        })
    }

    /// Register the callback sink. Pool owners set this once, at pool
    /// construction.
    pub fn set_events(&self, events: Rc<dyn AsocketEvents>) {
        *self.events.borrow_mut() = Some(events);
    }

    /// Slot index assigned by a pool owner.
    pub fn slot(&self) -> usize {
        self.slot.get()
    }

    /// Assign the slot index. Pool owners only.
    pub fn set_slot(&self, slot: usize) {
        self.slot.set(slot);
    }

    /// Current connection state.
    pub fn state(&self) -> SockState {
        self.state.get()
    }

    /// Whether the slot is free for reuse.
    pub fn is_free(&self) -> bool {
        self.state.get() == SockState::Free
    }

    /// Cached remote address of the current connection.
    pub fn remote(&self) -> Option<(EndpointAddr, u16)> {
        self.remote.borrow().clone()
    }

    /// Bind an accepted socket to this asocket.
    pub fn attach(&self, sock: RawSock, remote: Option<EndpointAddr>) -> Result<()> {
        if self.state.get() != SockState::Free {
            return Err(Error::InvalidParam("asocket slot already in use"));
        }
        sock.set_nonblocking(true)?;
        *self.sock.borrow_mut() = Some(sock);
        *self.remote.borrow_mut() = remote.map(|a| (a, 0));
        self.recv.borrow_mut().reset(self.initial_buf);
        self.paused.set(false);
        self.state.set(SockState::Connected);
        Ok(())
    }

    /// Start a non-blocking connect. Completion, success or failure, is
    /// reported through the on-connect callback.
    pub fn begin_connect(&self, addr: &EndpointAddr, port: u16) -> Result<()> {
        if self.state.get() != SockState::Free {
            return Err(Error::InvalidParam("asocket slot already in use"));
        }
        let sock = RawSock::stream(addr.domain())?;
        sock.start_connect(addr, port)?;
        *self.sock.borrow_mut() = Some(sock);
        *self.remote.borrow_mut() = Some((addr.clone(), port));
        self.recv.borrow_mut().reset(self.initial_buf);
        self.paused.set(false);
        self.state.set(SockState::Connecting);
        // The connect result arrives as writability; make sure the chain
        // is not blocked past it.
        self.controller.wakeup();
        Ok(())
    }

    /// Queue a buffer for sending.
    pub fn send(&self, data: SendData) -> Result<()> {
        match self.state.get() {
            SockState::Connected | SockState::Connecting => {}
            _ => return Err(Error::FailSendData),
        }
        self.pending.borrow_mut().push_back(PendingSend { data, off: 0 });
        self.controller.wakeup();
        Ok(())
    }

    /// Queue a copy of `buf` for sending.
    pub fn send_copy(&self, buf: &[u8]) -> Result<()> {
        self.send(SendData::Owned(buf.to_vec()))
    }

    /// Stop delivering on-data callbacks; bytes keep accumulating up to the
    /// buffer cap.
    pub fn pause(&self) {
        self.paused.set(true);
    }

    /// Re-enable delivery and wake the chain so buffered bytes are
    /// delivered promptly.
    pub fn resume(&self) {
        self.paused.set(false);
        self.controller.wakeup();
    }

    /// Close the connection locally. The on-disconnect callback fires with
    /// [`DisconnectReason::Local`].
    pub fn disconnect(&self) {
        if self.state.get() == SockState::Free {
            return;
        }
        self.teardown(DisconnectReason::Local);
    }

    fn teardown(&self, reason: DisconnectReason) {
        debug!("asocket {}: disconnect ({:?})", self.name, reason);
        *self.sock.borrow_mut() = None;
        self.state.set(SockState::Free);
        self.pending.borrow_mut().clear();
        self.recv.borrow_mut().reset(0);
        *self.remote.borrow_mut() = None;
        if let Some(events) = self.events_handle() {
            events.on_disconnect(self, reason);
        }
    }

    fn events_handle(&self) -> Option<Rc<dyn AsocketEvents>> {
        self.events.borrow().clone()
    }

    fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.sock.borrow().as_ref().map(|s| s.raw_fd())
    }

    /// Read until the socket would block, growing the buffer as needed.
    fn do_recv(&self) {
        loop {
            let mut rb = self.recv.borrow_mut();
            if rb.len == rb.buf.len() {
                if rb.buf.len() >= self.max_buf {
                    // Buffer capped; back off until the consumer catches up.
                    return;
                }
                let new_len = (rb.buf.len() * 2).clamp(self.initial_buf, self.max_buf);
                rb.buf.resize(new_len, 0);
            }
            let len = rb.len;
            let result = {
                let sock = self.sock.borrow();
                match sock.as_ref() {
                    Some(s) => s.recv(&mut rb.buf[len..]),
                    None => return,
                }
            };
            match result {
                Ok(0) => {
                    drop(rb);
                    self.peer_closed();
                    return;
                }
                Ok(n) => {
                    rb.len += n;
                }
                Err(Error::Io(ref e)) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(Error::Io(e)) => {
                    drop(rb);
                    self.teardown(DisconnectReason::Error(e.kind()));
                    return;
                }
                Err(_) => {
                    drop(rb);
                    self.teardown(DisconnectReason::Error(io::ErrorKind::Other));
                    return;
                }
            }
        }
    }

    fn peer_closed(&self) {
        if self.pending.borrow().is_empty() {
            self.teardown(DisconnectReason::PeerClosed);
        } else {
            // Flush what is queued, then close.
            self.state.set(SockState::Draining);
        }
    }

    /// Hand buffered bytes to the on-data callback and drop what it
    /// consumed.
    fn deliver(&self) {
        if self.paused.get() {
            return;
        }
        let events = match self.events_handle() {
            Some(e) => e,
            None => return,
        };
        // Take the buffer out so the callback runs without a live borrow;
        // it may disconnect or queue sends on this very asocket.
        let (mut data, len) = {
            let mut rb = self.recv.borrow_mut();
            if rb.len == 0 {
                return;
            }
            let len = rb.len;
            rb.len = 0;
            (std::mem::take(&mut rb.buf), len)
        };
        let outcome = events.on_data(self, &data[..len]);
        let consumed = match outcome {
            DataOutcome::Consumed(n) => n.min(len),
            DataOutcome::NeedMore => 0,
            DataOutcome::Invalid => len,
        };
        let mut rb = self.recv.borrow_mut();
        if self.state.get() == SockState::Free {
            // Torn down inside the callback; nothing to restore.
            return;
        }
        data.copy_within(consumed..len, 0);
        rb.buf = data;
        rb.len = len - consumed;
    }

    /// Write pending buffers until the socket would block.
    fn flush_pending(&self) {
        loop {
            let completed = {
                let mut pending = self.pending.borrow_mut();
                let head = match pending.front_mut() {
                    Some(h) => h,
                    None => break,
                };
                let bytes = head.data.as_bytes();
                let remaining = &bytes[head.off..];
                let result = {
                    let sock = self.sock.borrow();
                    match sock.as_ref() {
                        Some(s) => s.send(remaining),
                        None => return,
                    }
                };
                match result {
                    Ok(n) => {
                        head.off += n;
                        if head.off == bytes.len() {
                            pending.pop_front();
                            true
                        } else {
                            false
                        }
                    }
                    Err(Error::Io(ref e)) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => {
                        drop(pending);
                        self.teardown(DisconnectReason::Error(io::ErrorKind::BrokenPipe));
                        return;
                    }
                }
            };
            if completed {
                if let Some(events) = self.events_handle() {
                    events.on_send_ok(self);
                }
            } else {
                break;
            }
        }
        if self.state.get() == SockState::Draining && self.pending.borrow().is_empty() {
            self.teardown(DisconnectReason::PeerClosed);
        }
    }

    fn finish_connect(&self, sel: &Selector, fd: std::os::unix::io::RawFd) {
        if !sel.writable(fd) && !sel.errored(fd) {
            return;
        }
        let error = {
            let sock = self.sock.borrow();
            match sock.as_ref() {
                Some(s) => s.take_error().ok().flatten(),
                None => return,
            }
        };
        match error {
            None => {
                trace!("asocket {}: connected", self.name);
                self.state.set(SockState::Connected);
                if let Some(events) = self.events_handle() {
                    events.on_connect(self, Ok(()));
                }
            }
            Some(e) => {
                debug!("asocket {}: connect failed: {}", self.name, e);
                *self.sock.borrow_mut() = None;
                self.state.set(SockState::Free);
                *self.remote.borrow_mut() = None;
                if let Some(events) = self.events_handle() {
                    events.on_connect(self, Err(Error::FailConnect));
                }
            }
        }
    }
}

impl ChainObject for Asocket {
    fn name(&self) -> &str {
        &self.name
    }

    fn pre_select(&self, sel: &mut Selector) {
        let fd = match self.raw_fd() {
            Some(fd) => fd,
            None => return,
        };
        match self.state.get() {
            SockState::Free => {}
            SockState::Connecting => {
                sel.add_write(fd);
                sel.add_error(fd);
            }
            SockState::Connected => {
                // A capped-out buffer stops reads until the consumer
                // catches up.
                let buffer_full = {
                    let rb = self.recv.borrow();
                    rb.len >= self.max_buf
                };
                if !self.paused.get() && !self.no_read && !buffer_full {
                    sel.add_read(fd);
                }
                if !self.pending.borrow().is_empty() {
                    sel.add_write(fd);
                }
                sel.add_error(fd);
            }
            SockState::Draining => {
                if !self.pending.borrow().is_empty() {
                    sel.add_write(fd);
                }
                sel.add_error(fd);
            }
        }
    }

    fn post_select(&self, _nready: i32, sel: &Selector) {
        let fd = match self.raw_fd() {
            Some(fd) => fd,
            None => return,
        };
        match self.state.get() {
            SockState::Free => {}
            SockState::Connecting => self.finish_connect(sel, fd),
            SockState::Connected => {
                if sel.errored(fd) {
                    self.teardown(DisconnectReason::Error(io::ErrorKind::Other));
                    return;
                }
                if sel.readable(fd) && !self.paused.get() && !self.no_read {
                    self.do_recv();
                }
                if self.state.get() != SockState::Free {
                    self.deliver();
                }
                if self.state.get() != SockState::Free && sel.writable(fd) {
                    self.flush_pending();
                }
            }
            SockState::Draining => {
                if sel.errored(fd) {
                    self.teardown(DisconnectReason::PeerClosed);
                    return;
                }
                if sel.writable(fd) {
                    self.flush_pending();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_requires_connection() {
        let chain = crate::net::chain::Chain::new().unwrap();
        let asock = Asocket::new(chain.controller(), "test", 128, false);
        assert!(matches!(
            asock.send_copy(b"nope"),
            Err(Error::FailSendData)
        ));
    }

    #[test]
    fn test_attach_rejects_busy_slot() {
        let chain = crate::net::chain::Chain::new().unwrap();
        let asock = Asocket::new(chain.controller(), "test", 128, false);
        let (a, b) = RawSock::pair().unwrap();
        asock.attach(a, None).unwrap();
        assert!(asock.attach(b, None).is_err());
        assert_eq!(asock.state(), SockState::Connected);
    }
}

impl RecvBuf {
    fn reset(&mut self, initial: usize) {
        self.buf.clear();
        self.buf.resize(initial, 0);
        self.len = 0;
    }
}
