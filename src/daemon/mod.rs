//! # Daemon Module
//!
//! The request/response framing every daemon speaks ([`proto`]), the
//! shared runtime pieces of the daemon binaries ([`runtime`]), and the
//! three server skeletons built on the chain and the async server socket:
//! the config manager, the log server and the service manager. Each daemon
//! owns a fixed Unix-domain socket path and a protocol magic; a mismatched
//! magic discards the buffered bytes while the connection stays open.

pub mod configmgr;
pub mod logserver;
pub mod proto;
pub mod runtime;
pub mod servmgmt;

pub use configmgr::{ConfigMgrConfig, ConfigMgrServer, ConfigTree};
pub use logserver::{LogRecord, LogServer, LogServerConfig, LogSink, StdoutSink};
pub use proto::{FrameStep, WireHeader, HEADER_LEN};
pub use runtime::{DaemonOpts, DaemonSettings};
pub use servmgmt::{ServMgmtConfig, ServMgmtServer, ServStatus, ServiceTable, StartupType};
