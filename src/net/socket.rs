//! # Raw Socket Wrapper
//!
//! Blocking and non-blocking socket primitives shared by the async layer
//! and by test clients: single-syscall send/recv, exact-count loops,
//! select-based timeout variants, connect with timeout, listen/accept,
//! datagram send/recv, multicast join and broadcast enable. Both IPv4 and
//! Unix-domain endpoints are supported through [`EndpointAddr`].

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read, Write};
use std::mem::MaybeUninit;
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use super::addr::EndpointAddr;
use crate::error::{Error, Result};

/// Wait for a single descriptor to become readable or writable.
///
/// Returns false on timeout. This is the primitive under every
/// `*_with_timeout` variant.
pub(crate) fn wait_fd(fd: RawFd, for_write: bool, timeout: Duration) -> Result<bool> {
    let mut set: libc::fd_set = unsafe { std::mem::zeroed() };
    unsafe { libc::FD_SET(fd, &mut set) };
    let mut tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    let set_ptr: *mut libc::fd_set = &mut set;
    let (read_ptr, write_ptr) = if for_write {
        (std::ptr::null_mut(), set_ptr)
    } else {
        (set_ptr, std::ptr::null_mut())
    };
    let rc = unsafe {
        libc::select(fd + 1, read_ptr, write_ptr, std::ptr::null_mut(), &mut tv)
    };
    if rc < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(rc > 0)
}

/// A thin, typed wrapper over one socket descriptor.
pub struct RawSock {
    sock: Socket,
}

impl RawSock {
    /// Create a stream socket in the endpoint's domain.
    pub fn stream(domain: Domain) -> Result<RawSock> {
        let sock = Socket::new(domain, Type::STREAM, None).map_err(|_| Error::FailCreateSocket)?;
        Ok(RawSock { sock })
    }

    /// Create a datagram socket in the endpoint's domain.
    pub fn dgram(domain: Domain) -> Result<RawSock> {
        let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|_| Error::FailCreateSocket)?;
        Ok(RawSock { sock })
    }

    /// Create a datagram socket without a fixed protocol (Unix domain).
    pub fn dgram_unix() -> Result<RawSock> {
        let sock =
            Socket::new(Domain::UNIX, Type::DGRAM, None).map_err(|_| Error::FailCreateSocket)?;
        Ok(RawSock { sock })
    }

    /// Create a connected pair of Unix-domain stream sockets.
    pub fn pair() -> Result<(RawSock, RawSock)> {
        let (a, b) =
            Socket::pair(Domain::UNIX, Type::STREAM, None).map_err(|_| Error::FailCreateSocket)?;
        Ok((RawSock { sock: a }, RawSock { sock: b }))
    }

    /// Wrap an accepted or otherwise pre-made socket.
    pub(crate) fn from_socket(sock: Socket) -> RawSock {
        RawSock { sock }
    }

    /// Bind to `addr`; for Unix-domain endpoints a stale socket file is
    /// removed first.
    pub fn bind(&self, addr: &EndpointAddr, port: u16) -> Result<()> {
        if let Some(path) = addr.uds_path() {
            let _ = std::fs::remove_file(path);
        }
        self.sock.set_reuse_address(true)?;
        self.sock.bind(&addr.to_sock_addr(port)?)?;
        Ok(())
    }

    /// Start listening with the given backlog.
    pub fn listen(&self, backlog: i32) -> Result<()> {
        self.sock.listen(backlog)?;
        Ok(())
    }

    /// Accept one pending connection.
    pub fn accept(&self) -> Result<(RawSock, Option<EndpointAddr>)> {
        let (sock, addr) = self.sock.accept()?;
        let remote = addr
            .as_socket_ipv4()
            .map(|sa| EndpointAddr::Inet(*sa.ip()))
            .or_else(|| addr.as_pathname().map(EndpointAddr::uds));
        Ok((RawSock { sock }, remote))
    }

    /// Blocking connect.
    pub fn connect(&self, addr: &EndpointAddr, port: u16) -> Result<()> {
        self.sock
            .connect(&addr.to_sock_addr(port)?)
            .map_err(|_| Error::FailConnect)
    }

    /// Connect, giving up after `timeout`.
    ///
    /// Implemented as a non-blocking connect followed by a select on
    /// writability; the socket is returned to blocking mode afterwards.
    pub fn connect_with_timeout(
        &self,
        addr: &EndpointAddr,
        port: u16,
        timeout: Duration,
    ) -> Result<()> {
        self.sock.set_nonblocking(true)?;
        let pending = match self.sock.connect(&addr.to_sock_addr(port)?) {
            Ok(()) => false,
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => true,
            Err(_) => {
                let _ = self.sock.set_nonblocking(false);
                return Err(Error::FailConnect);
            }
        };
        let result = if pending {
            match wait_fd(self.raw_fd(), true, timeout)? {
                false => Err(Error::Timeout),
                true => match self.sock.take_error()? {
                    Some(_) => Err(Error::FailConnect),
                    None => Ok(()),
                },
            }
        } else {
            Ok(())
        };
        self.sock.set_nonblocking(false)?;
        result
    }

    /// Send once; partial writes are allowed.
    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        Ok((&self.sock).write(buf)?)
    }

    /// Send the whole buffer, looping over partial writes.
    pub fn sendn(&self, buf: &[u8]) -> Result<()> {
        (&self.sock).write_all(buf).map_err(|_| Error::FailSendData)
    }

    /// Send the whole buffer or fail once `timeout` elapses without
    /// writability.
    pub fn sendn_with_timeout(&self, buf: &[u8], timeout: Duration) -> Result<()> {
        let mut sent = 0;
        while sent < buf.len() {
            if !wait_fd(self.raw_fd(), true, timeout)? {
                return Err(Error::Timeout);
            }
            match (&self.sock).write(&buf[sent..]) {
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(_) => return Err(Error::FailSendData),
            }
        }
        Ok(())
    }

    /// Receive once; fewer bytes than requested are allowed. Zero means the
    /// peer closed the connection.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        Ok((&self.sock).read(buf)?)
    }

    /// Receive exactly `buf.len()` bytes.
    pub fn recvn(&self, buf: &mut [u8]) -> Result<()> {
        (&self.sock).read_exact(buf).map_err(|_| Error::FailRecvData)
    }

    /// Receive exactly `buf.len()` bytes or fail once `timeout` elapses
    /// without readability.
    pub fn recvn_with_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        let mut got = 0;
        while got < buf.len() {
            if !wait_fd(self.raw_fd(), false, timeout)? {
                return Err(Error::Timeout);
            }
            match (&self.sock).read(&mut buf[got..]) {
                Ok(0) => return Err(Error::FailRecvData),
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(_) => return Err(Error::FailRecvData),
            }
        }
        Ok(())
    }

    /// Send one datagram to `addr`.
    pub fn send_to(&self, buf: &[u8], addr: &EndpointAddr, port: u16) -> Result<usize> {
        Ok(self.sock.send_to(buf, &addr.to_sock_addr(port)?)?)
    }

    /// Receive one datagram.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Option<EndpointAddr>)> {
        let mut tmp: Vec<MaybeUninit<u8>> = vec![MaybeUninit::uninit(); buf.len()];
        let (n, addr) = self.sock.recv_from(&mut tmp)?;
        for (dst, src) in buf.iter_mut().zip(tmp.iter().take(n)) {
            *dst = unsafe { src.assume_init() };
        }
        let from = addr
            .as_socket_ipv4()
            .map(|sa| EndpointAddr::Inet(*sa.ip()))
            .or_else(|| addr.as_pathname().map(EndpointAddr::uds));
        Ok((n, from))
    }

    /// Join an IPv4 multicast group on the given interface.
    pub fn join_multicast(&self, group: &Ipv4Addr, interface: &Ipv4Addr) -> Result<()> {
        self.sock.join_multicast_v4(group, interface)?;
        Ok(())
    }

    /// Allow broadcast datagrams.
    pub fn enable_broadcast(&self) -> Result<()> {
        self.sock.set_broadcast(true)?;
        Ok(())
    }

    /// Toggle non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.sock.set_nonblocking(nonblocking)?;
        Ok(())
    }

    /// Start a non-blocking connect. Returns true when the connect finished
    /// immediately; false when it is in progress and completion will show
    /// up as writability.
    pub fn start_connect(&self, addr: &EndpointAddr, port: u16) -> Result<bool> {
        self.sock.set_nonblocking(true)?;
        match self.sock.connect(&addr.to_sock_addr(port)?) {
            Ok(()) => Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(_) => Err(Error::FailConnect),
        }
    }

    /// Pending asynchronous error on the socket, if any.
    pub fn take_error(&self) -> Result<Option<io::Error>> {
        Ok(self.sock.take_error()?)
    }

    /// The raw descriptor, for select registration.
    pub fn raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

impl AsRawFd for RawSock {
    fn as_raw_fd(&self) -> RawFd {
        self.raw_fd()
    }
}
