//! # IPC Substrate
//!
//! The runtime substrate for a small distributed service platform: a
//! single-threaded reactor ("chain") with registered objects, asynchronous
//! socket pools built on it, deferred timers, a buddy page/object memory
//! pool, a hierarchical state machine, and the per-destination message
//! transfer engine the dispatcher daemon is built from.

pub mod attask;
pub mod daemon;
pub mod dispatcher;
pub mod error;
pub mod hsm;
pub mod logging;
pub mod mempool;
pub mod net;
pub mod respool;

pub use attask::Attask;
pub use dispatcher::{DispatcherMsg, Xfer, XferPool};
pub use error::{Error, Result};
pub use hsm::Hsm;
pub use mempool::{ObjectCache, PageAllocator};
pub use net::{Acsocket, Asocket, Assocket, Chain, ChainController, Utimer};
pub use respool::{ResourceFactory, ResourcePool};

/// The current version of the substrate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default receive buffer size for a new connection, in bytes.
    pub const RECV_BUFFER_SIZE: usize = 2048;

    /// Default number of connection slots in a server socket pool.
    pub const SERVER_POOL_SIZE: usize = 16;

    /// Default number of connection slots in an outbound connect pool.
    pub const CLIENT_POOL_SIZE: usize = 2;

    /// Default cap on queued dispatcher messages per destination.
    pub const MAX_QUEUED_MSGS: u32 = 100;

    /// Time an idle transfer connection is kept open.
    pub const XFER_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

    /// Time an unused transfer object is kept alive.
    pub const XFER_FREE_TIMEOUT: Duration = Duration::from_secs(300);

    /// Memory pool size for a daemon, in bytes.
    pub const POOL_SIZE: usize = 1 << 22;
}
