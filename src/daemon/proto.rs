//! # Daemon Request/Response Framing
//!
//! Every daemon serves a small request/response protocol over its
//! Unix-domain socket. A message is a fixed header followed by a
//! message-id-specific body, in host byte order:
//!
//! ```text
//! u8  msg_id      u8[3]  reserved
//! u32 seq         u32    magic
//! u32 payload     u32    result
//! u32 tx_id       u32[2] reserved
//! ```
//!
//! The magic number is per daemon. A header whose magic does not match is
//! unrecoverable: the server discards everything buffered and waits for
//! the peer to resynchronize on the next well-framed message. Short reads
//! keep the buffer; that contract is exactly what the asocket on-data
//! callback expresses with [`DataOutcome`].

use crate::error::{Error, Result};
use crate::net::DataOutcome;

/// Wire size of the header.
pub const HEADER_LEN: usize = 32;

/// Result codes carried in response headers.
pub mod results {
    /// Request handled.
    pub const SUCCESS: u32 = 0;
    /// Named entity does not exist.
    pub const NOT_FOUND: u32 = 1;
    /// Request body malformed.
    pub const INVALID_PARAM: u32 = 2;
    /// Unknown message id.
    pub const UNSUPPORTED: u32 = 3;
    /// No free transaction or service slot.
    pub const MAX_RESOURCES: u32 = 4;
    /// Operation valid but refused in the current state.
    pub const REFUSED: u32 = 5;
}

/// Parsed header of one request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireHeader {
    /// Message id, daemon-specific.
    pub msg_id: u8,
    /// Sequence number, echoed in the response.
    pub seq: u32,
    /// Per-daemon magic number.
    pub magic: u32,
    /// Body size in bytes.
    pub payload_size: u32,
    /// Result code; zero in requests.
    pub result: u32,
    /// Transaction id; zero outside transactions.
    pub tx_id: u32,
}

impl WireHeader {
    /// Header for a request.
    pub fn request(msg_id: u8, magic: u32, seq: u32) -> WireHeader {
        WireHeader {
            msg_id,
            seq,
            magic,
            ..Default::default()
        }
    }

    /// Response header echoing a request's seq and magic.
    pub fn response_to(&self, msg_id: u8, result: u32) -> WireHeader {
        WireHeader {
            msg_id,
            seq: self.seq,
            magic: self.magic,
            payload_size: 0,
            result,
            tx_id: self.tx_id,
        }
    }

    /// Serialize to the wire layout.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.msg_id;
        buf[4..8].copy_from_slice(&self.seq.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.magic.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.payload_size.to_ne_bytes());
        buf[16..20].copy_from_slice(&self.result.to_ne_bytes());
        buf[20..24].copy_from_slice(&self.tx_id.to_ne_bytes());
        buf
    }

    /// Parse from the wire layout.
    pub fn decode(buf: &[u8]) -> Result<WireHeader> {
        if buf.len() < HEADER_LEN {
            return Err(Error::IncompleteData);
        }
        let u32_at = |off: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&buf[off..off + 4]);
            u32::from_ne_bytes(raw)
        };
        Ok(WireHeader {
            msg_id: buf[0],
            seq: u32_at(4),
            magic: u32_at(8),
            payload_size: u32_at(12),
            result: u32_at(16),
            tx_id: u32_at(20),
        })
    }
}

/// One step of pulling frames out of a receive buffer.
pub enum FrameStep<'a> {
    /// Not enough bytes for a header or the advertised body.
    Incomplete,
    /// The magic does not match; the buffer is garbage.
    Invalid,
    /// A whole message.
    Complete {
        header: WireHeader,
        body: &'a [u8],
        consumed: usize,
    },
}

/// Examine the front of `buf` for one complete message.
pub fn next_frame(buf: &[u8], magic: u32) -> FrameStep<'_> {
    let header = match WireHeader::decode(buf) {
        Ok(h) => h,
        Err(_) => return FrameStep::Incomplete,
    };
    if header.magic != magic {
        return FrameStep::Invalid;
    }
    let total = HEADER_LEN + header.payload_size as usize;
    if buf.len() < total {
        return FrameStep::Incomplete;
    }
    FrameStep::Complete {
        header,
        body: &buf[HEADER_LEN..total],
        consumed: total,
    }
}

/// Drain every complete message at the front of `buf` through `handle`,
/// translating the leftover into the on-data outcome: consumed bytes for
/// what was handled, keep-waiting for a partial tail, discard-everything
/// for a magic mismatch.
pub fn consume_frames(
    buf: &[u8],
    magic: u32,
    mut handle: impl FnMut(WireHeader, &[u8]),
) -> DataOutcome {
    let mut off = 0;
    loop {
        match next_frame(&buf[off..], magic) {
            FrameStep::Complete {
                header,
                body,
                consumed,
            } => {
                handle(header, body);
                off += consumed;
            }
            FrameStep::Incomplete => {
                return if off > 0 {
                    DataOutcome::Consumed(off)
                } else {
                    DataOutcome::NeedMore
                };
            }
            FrameStep::Invalid => return DataOutcome::Invalid,
        }
    }
}

/// Append a native-endian u16 to a body under construction.
pub fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_ne_bytes());
}

/// Read a native-endian u16 at `off`.
pub fn get_u16(buf: &[u8], off: usize) -> Result<u16> {
    if buf.len() < off + 2 {
        return Err(Error::BufferTooSmall);
    }
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&buf[off..off + 2]);
    Ok(u16::from_ne_bytes(raw))
}

/// Serialize a header and body into one outbound buffer.
pub fn encode_message(header: &WireHeader, body: &[u8]) -> Vec<u8> {
    let mut header = *header;
    header.payload_size = body.len() as u32;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: u32 = 0x5445_5354;

    fn frame(msg_id: u8, body: &[u8]) -> Vec<u8> {
        encode_message(&WireHeader::request(msg_id, MAGIC, 7), body)
    }

    #[test]
    fn test_header_round_trip() {
        let header = WireHeader {
            msg_id: 3,
            seq: 99,
            magic: MAGIC,
            payload_size: 12,
            result: 1,
            tx_id: 5,
        };
        let decoded = WireHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_consume_two_frames_and_tail() {
        let mut buf = frame(1, b"abc");
        buf.extend_from_slice(&frame(2, b""));
        // Truncated third message.
        buf.extend_from_slice(&frame(3, b"xyz")[..10]);

        let mut seen = Vec::new();
        let outcome = consume_frames(&buf, MAGIC, |h, body| {
            seen.push((h.msg_id, body.to_vec()));
        });
        assert_eq!(seen, vec![(1u8, b"abc".to_vec()), (2u8, Vec::new())]);
        assert_eq!(
            outcome,
            DataOutcome::Consumed(2 * HEADER_LEN + 3)
        );
    }

    #[test]
    fn test_short_buffer_needs_more() {
        let buf = frame(1, b"abcdef");
        let outcome = consume_frames(&buf[..HEADER_LEN + 2], MAGIC, |_, _| {
            panic!("nothing complete")
        });
        assert_eq!(outcome, DataOutcome::NeedMore);
    }

    /// A bad magic poisons the whole buffer, complete frames included.
    #[test]
    fn test_bad_magic_discards_buffer() {
        let buf = frame(1, b"abc");
        let outcome = consume_frames(&buf, MAGIC ^ 1, |_, _| panic!("must not parse"));
        assert_eq!(outcome, DataOutcome::Invalid);
    }
}
