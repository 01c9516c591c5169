//! # Error Types
//!
//! This module defines the error type shared by every subsystem in the crate:
//! the memory pool, the state machine, the socket layer, the reactor chain
//! and the dispatcher transfer engine.
//!
//! ## Design Considerations
//!
//! - **One enum**: all library surfaces return `crate::Result<T>`, so callers
//!   match on a single error space regardless of which subsystem failed.
//! - **I/O transparency**: raw `std::io::Error` values are wrapped rather
//!   than stringified, preserving `ErrorKind` for callers that care.
//! - **Callback policy**: the chain logs and swallows callback errors; the
//!   error type therefore never carries state a callback must recover.

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds shared across the substrate.
#[derive(Debug, Error)]
pub enum Error {
    /// Memory pool cannot satisfy the allocation and WAIT was not requested.
    #[error("memory pool out of memory")]
    OutOfMemory,

    /// A parameter is outside its documented domain.
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// Operation on an object that has not been initialized or was shut down.
    #[error("not initialized")]
    NotInitialized,

    /// Another instance of the daemon already holds the pid file.
    #[error("daemon already running (pid {0})")]
    AlreadyRunning(u32),

    /// Not enough bytes for a complete message; the caller retains the buffer.
    #[error("incomplete data")]
    IncompleteData,

    /// The bytes cannot be a valid message; the caller discards the buffer.
    #[error("invalid data")]
    InvalidData,

    /// The supplied buffer cannot hold the result.
    #[error("buffer too small")]
    BufferTooSmall,

    /// Process control failures, reported by the service manager.
    #[error("failed to create process")]
    FailCreateProcess,
    #[error("failed to terminate process")]
    FailTerminateProcess,
    #[error("failed to wait for process termination")]
    FailWaitProcessTermination,

    /// Socket layer failures.
    #[error("failed to create socket")]
    FailCreateSocket,
    #[error("failed to connect")]
    FailConnect,
    #[error("failed to send data")]
    FailSendData,
    #[error("failed to receive data")]
    FailRecvData,
    #[error("operation timed out")]
    Timeout,

    /// The state machine has no table or callback for the given state.
    #[error("hsm state {0} not found")]
    HsmStateNotFound(u32),

    /// A message is already bound to the transfer object.
    #[error("previous dispatcher message not sent")]
    PreviousMsgNotSent,

    /// A bounded resource table (connection slots, transactions, queue
    /// entries) is full.
    #[error("maximum resources reached")]
    ReachMaxResources,

    /// Underlying operating system error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error means "wait for more bytes" rather than failure.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Error::IncompleteData)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Io errors convert through `?` and keep their kind.
    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let err: Error = io.into();
        match err {
            Error::Io(inner) => {
                assert_eq!(inner.kind(), std::io::ErrorKind::ConnectionRefused)
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_incomplete_predicate() {
        assert!(Error::IncompleteData.is_incomplete());
        assert!(!Error::InvalidData.is_incomplete());
    }
}
