//! Typed endpoint addresses.
//!
//! Every socket in the substrate is addressed by an [`EndpointAddr`]: either
//! an IPv4 address (paired with a port at the call site) or a Unix-domain
//! socket path. The port argument is ignored for Unix-domain endpoints.

use socket2::{Domain, SockAddr};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// An IPv4 or Unix-domain endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointAddr {
    /// IPv4 address; the port travels separately.
    Inet(Ipv4Addr),
    /// Unix-domain socket path.
    Uds(PathBuf),
}

impl EndpointAddr {
    /// Loopback IPv4 endpoint.
    pub fn loopback() -> EndpointAddr {
        EndpointAddr::Inet(Ipv4Addr::LOCALHOST)
    }

    /// Unix-domain endpoint for `path`.
    pub fn uds(path: impl AsRef<Path>) -> EndpointAddr {
        EndpointAddr::Uds(path.as_ref().to_path_buf())
    }

    /// Socket domain this endpoint lives in.
    pub fn domain(&self) -> Domain {
        match self {
            EndpointAddr::Inet(_) => Domain::IPV4,
            EndpointAddr::Uds(_) => Domain::UNIX,
        }
    }

    /// Resolve to a connectable/bindable socket address.
    ///
    /// `port` applies to IPv4 endpoints only.
    pub fn to_sock_addr(&self, port: u16) -> Result<SockAddr> {
        match self {
            EndpointAddr::Inet(ip) => Ok(SockAddr::from(SocketAddrV4::new(*ip, port))),
            EndpointAddr::Uds(path) => Ok(SockAddr::unix(path)?),
        }
    }

    /// The Unix-domain path, when this is a UDS endpoint.
    pub fn uds_path(&self) -> Option<&Path> {
        match self {
            EndpointAddr::Uds(p) => Some(p),
            EndpointAddr::Inet(_) => None,
        }
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointAddr::Inet(ip) => write!(f, "{}", ip),
            EndpointAddr::Uds(path) => write!(f, "{}", path.display()),
        }
    }
}
