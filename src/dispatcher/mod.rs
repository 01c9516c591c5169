//! # Dispatcher Module
//!
//! The message-dispatch side of the substrate: the reference-counted
//! [`DispatcherMsg`] with its fixed framing header, the per-destination
//! [`XferPool`] send engine, and the thread-safe [`Xfer`] queue facade in
//! front of it. A daemon creates one xfer per destination endpoint; the
//! dispatcher daemon itself serves endpoints under [`UDS_DIR`].

use std::io;
use std::path::Path;

use crate::error::Result;

pub mod message;
pub mod xfer;
pub mod xferpool;

pub use message::{DispatcherMsg, PriorityClass, HEADER_SIZE, RESERVED_MSG_ID};
pub use xfer::{Xfer, XferConfig, XferSender};
pub use xferpool::{XferPool, XferPoolConfig, XferPoolEvents};

/// Directory holding the dispatcher's per-service Unix-domain sockets.
pub const UDS_DIR: &str = "/tmp/dispatcher";

/// Create the dispatcher socket directory, tolerating an existing one.
pub fn ensure_uds_dir(dir: impl AsRef<Path>) -> Result<()> {
    match std::fs::create_dir_all(dir.as_ref()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}
