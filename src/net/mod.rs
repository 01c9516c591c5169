//! # Network Module
//!
//! The reactor core and the socket hierarchy built on it:
//!
//! - [`Chain`]: the single-threaded select loop over registered objects
//! - [`Utimer`]: deferred timers driven by the chain's block time
//! - [`RawSock`]: blocking and non-blocking socket primitives
//! - [`Asocket`]: one buffered connection registered in the chain
//! - [`Assocket`]: a listening socket with a slab of asockets
//! - [`Acsocket`]: a pool of asockets for outbound connects
//!
//! Everything except [`ChainController`] is confined to the chain's thread.

pub mod acsocket;
pub mod addr;
pub mod asocket;
pub mod assocket;
pub mod chain;
pub mod socket;
pub mod utimer;

pub use acsocket::{Acsocket, AcsocketConfig, ClientEvents};
pub use addr::EndpointAddr;
pub use asocket::{Asocket, AsocketEvents, DataOutcome, DisconnectReason, SendData, SockState};
pub use assocket::{Assocket, AssocketConfig, ConnId, ServerEvents};
pub use chain::{Chain, ChainController, ChainObject, Selector, MAX_BLOCK_MS};
pub use socket::RawSock;
pub use utimer::Utimer;
