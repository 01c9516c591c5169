//! # Dispatcher Messages
//!
//! Every message a daemon hands to the dispatcher starts with a fixed
//! header at the front of the payload buffer: message id, priority, source
//! and destination process ids, and the payload size. The helpers here
//! read and write those fields at their fixed offsets, in host byte order.
//!
//! A [`DispatcherMsg`] is a reference-counted handle over the bytes: the
//! send queue holds owning handles, the transfer engine borrows one for the
//! in-flight message, and the bytes are dropped when the last handle goes
//! away.

use std::sync::Arc;

use crate::error::{Error, Result};

/// Size of the messaging header, in bytes.
pub const HEADER_SIZE: usize = 20;

/// Message ids at or above this value are reserved for infrastructure use
/// (heartbeats and the like) and are never dispatched to user handlers.
pub const RESERVED_MSG_ID: u32 = 0xFFFF_0000;

const OFF_MSG_ID: usize = 0;
const OFF_PRIO: usize = 4;
const OFF_SOURCE: usize = 8;
const OFF_DESTINATION: usize = 12;
const OFF_PAYLOAD_SIZE: usize = 16;

/// Low priority class.
pub const PRIO_LOW: u8 = 0;
/// Mid priority class.
pub const PRIO_MID: u8 = 1;
/// High priority class.
pub const PRIO_HIGH: u8 = 2;

/// The three queueing classes a priority byte maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityClass {
    High,
    Mid,
    Low,
}

impl PriorityClass {
    /// Classify a raw priority byte; anything above mid is high.
    pub fn from_byte(prio: u8) -> PriorityClass {
        match prio {
            PRIO_LOW => PriorityClass::Low,
            PRIO_MID => PriorityClass::Mid,
            _ => PriorityClass::High,
        }
    }
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[off..off + 4]);
    u32::from_ne_bytes(raw)
}

fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_ne_bytes());
}

fn get_i32(buf: &[u8], off: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[off..off + 4]);
    i32::from_ne_bytes(raw)
}

fn put_i32(buf: &mut [u8], off: usize, value: i32) {
    buf[off..off + 4].copy_from_slice(&value.to_ne_bytes());
}

/// Write a fresh header into `buf`, with the source set to this process.
pub fn init_header(buf: &mut [u8], msg_id: u32, prio: u8, payload_size: u32) -> Result<()> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::BufferTooSmall);
    }
    buf[..HEADER_SIZE].fill(0);
    put_u32(buf, OFF_MSG_ID, msg_id);
    buf[OFF_PRIO] = prio;
    put_i32(buf, OFF_SOURCE, std::process::id() as i32);
    put_u32(buf, OFF_PAYLOAD_SIZE, payload_size);
    Ok(())
}

/// Message id field.
pub fn msg_id(buf: &[u8]) -> u32 {
    get_u32(buf, OFF_MSG_ID)
}

/// Set the message id field.
pub fn set_msg_id(buf: &mut [u8], id: u32) {
    put_u32(buf, OFF_MSG_ID, id);
}

/// Priority byte.
pub fn priority(buf: &[u8]) -> u8 {
    buf[OFF_PRIO]
}

/// Source process id.
pub fn source_id(buf: &[u8]) -> i32 {
    get_i32(buf, OFF_SOURCE)
}

/// Set the source process id.
pub fn set_source_id(buf: &mut [u8], pid: i32) {
    put_i32(buf, OFF_SOURCE, pid);
}

/// Destination process id.
pub fn destination_id(buf: &[u8]) -> i32 {
    get_i32(buf, OFF_DESTINATION)
}

/// Set the destination process id.
pub fn set_destination_id(buf: &mut [u8], pid: i32) {
    put_i32(buf, OFF_DESTINATION, pid);
}

/// Payload size field.
pub fn payload_size(buf: &[u8]) -> u32 {
    get_u32(buf, OFF_PAYLOAD_SIZE)
}

/// Set the payload size field.
pub fn set_payload_size(buf: &mut [u8], size: u32) {
    put_u32(buf, OFF_PAYLOAD_SIZE, size);
}

/// Header size plus the payload size recorded in the header.
pub fn total_size(buf: &[u8]) -> usize {
    HEADER_SIZE + payload_size(buf) as usize
}

/// A reference-counted dispatcher message.
///
/// Cloning the handle shares the bytes; the bytes are destroyed when the
/// last handle drops.
#[derive(Clone)]
pub struct DispatcherMsg {
    data: Arc<Vec<u8>>,
}

impl DispatcherMsg {
    /// Copy `bytes` into a new message. The buffer must start with a full
    /// messaging header.
    pub fn create(bytes: &[u8]) -> Result<DispatcherMsg> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidParam("message shorter than its header"));
        }
        Ok(DispatcherMsg {
            data: Arc::new(bytes.to_vec()),
        })
    }

    /// The full message bytes, header included.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Shared handle over the bytes, for zero-copy sends.
    pub fn shared(&self) -> Arc<Vec<u8>> {
        Arc::clone(&self.data)
    }

    /// Number of live handles over these bytes.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    /// Whether two handles share the same bytes.
    pub fn ptr_eq(&self, other: &DispatcherMsg) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Message id field.
    pub fn msg_id(&self) -> u32 {
        msg_id(&self.data)
    }

    /// Priority byte.
    pub fn priority(&self) -> u8 {
        priority(&self.data)
    }

    /// Queueing class of this message.
    pub fn priority_class(&self) -> PriorityClass {
        PriorityClass::from_byte(self.priority())
    }

    /// Source process id.
    pub fn source_id(&self) -> i32 {
        source_id(&self.data)
    }

    /// Destination process id.
    pub fn destination_id(&self) -> i32 {
        destination_id(&self.data)
    }

    /// Whether the id marks an infrastructure message that must not reach
    /// user handlers.
    pub fn is_reserved(&self) -> bool {
        self.msg_id() >= RESERVED_MSG_ID
    }

    /// Total length of the message bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Messages always carry at least a header.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for DispatcherMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherMsg")
            .field("id", &self.msg_id())
            .field("prio", &self.priority())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_msg(id: u32, prio: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE + payload.len()];
        init_header(&mut buf, id, prio, payload.len() as u32).unwrap();
        buf[HEADER_SIZE..].copy_from_slice(payload);
        buf
    }

    /// Fields land at their fixed offsets and read back intact.
    #[test]
    fn test_header_field_round_trip() {
        let mut buf = sample_msg(42, PRIO_MID, b"abc");
        set_destination_id(&mut buf, 1234);
        set_source_id(&mut buf, 77);

        assert_eq!(msg_id(&buf), 42);
        assert_eq!(priority(&buf), PRIO_MID);
        assert_eq!(source_id(&buf), 77);
        assert_eq!(destination_id(&buf), 1234);
        assert_eq!(payload_size(&buf), 3);
        assert_eq!(total_size(&buf), HEADER_SIZE + 3);
    }

    #[test]
    fn test_init_header_sets_source_pid() {
        let buf = sample_msg(1, PRIO_LOW, b"");
        assert_eq!(source_id(&buf), std::process::id() as i32);
    }

    #[test]
    fn test_reserved_ids_are_flagged() {
        let user = DispatcherMsg::create(&sample_msg(5, PRIO_LOW, b"")).unwrap();
        let infra = DispatcherMsg::create(&sample_msg(RESERVED_MSG_ID, PRIO_HIGH, b"")).unwrap();
        assert!(!user.is_reserved());
        assert!(infra.is_reserved());
    }

    #[test]
    fn test_priority_classes() {
        assert_eq!(PriorityClass::from_byte(PRIO_LOW), PriorityClass::Low);
        assert_eq!(PriorityClass::from_byte(PRIO_MID), PriorityClass::Mid);
        assert_eq!(PriorityClass::from_byte(PRIO_HIGH), PriorityClass::High);
        assert_eq!(PriorityClass::from_byte(9), PriorityClass::High);
    }

    /// Handles share bytes; the count tracks clones and drops.
    #[test]
    fn test_ref_count_tracks_handles() {
        let msg = DispatcherMsg::create(&sample_msg(1, PRIO_LOW, b"xy")).unwrap();
        assert_eq!(msg.ref_count(), 1);
        let other = msg.clone();
        assert_eq!(msg.ref_count(), 2);
        assert!(msg.ptr_eq(&other));
        drop(other);
        assert_eq!(msg.ref_count(), 1);
    }

    #[test]
    fn test_create_rejects_short_buffer() {
        assert!(DispatcherMsg::create(&[0u8; HEADER_SIZE - 1]).is_err());
    }
}
