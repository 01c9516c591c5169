//! # Log Server
//!
//! The log-collection daemon's skeleton: a request/response server that
//! accepts save-log requests and hands each record to a pluggable sink.
//! Only the stdout sink ships here; file and tty sinks are outer layers.

use std::rc::Rc;
use tracing::{info, warn};

use super::proto::{consume_frames, encode_message, get_u16, put_u16, results, WireHeader};
use crate::error::{Error, Result};
use crate::net::{
    Assocket, AssocketConfig, Chain, ConnId, DataOutcome, EndpointAddr, ServerEvents,
};

/// Magic number of the log server protocol ("LOGS").
pub const MAGIC: u32 = 0x4C4F_4753;

/// Default socket path of the log server daemon.
pub const SOCKET_PATH: &str = "/tmp/logserver_server";

/// Message ids of the log server protocol.
pub mod msg {
    pub const SAVE_LOG_REQ: u8 = 1;
    pub const SAVE_LOG_RESP: u8 = 2;
}

/// One collected log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Severity, in the daemons' 0..5 scale.
    pub level: u8,
    /// Source tag, usually the submitting program name.
    pub tag: String,
    /// The message text.
    pub text: String,
}

/// Destination for collected records.
pub trait LogSink {
    /// Persist or display one record.
    fn save(&self, record: &LogRecord);
}

/// Sink writing records to standard output.
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn save(&self, record: &LogRecord) {
        println!("[{}] {}: {}", record.level, record.tag, record.text);
    }
}

/// Parameters for the log server.
pub struct LogServerConfig {
    /// Listening endpoint.
    pub addr: EndpointAddr,
    /// Concurrent client connections served.
    pub max_conns: usize,
    /// Where accepted records go.
    pub sink: Rc<dyn LogSink>,
}

impl Default for LogServerConfig {
    fn default() -> Self {
        LogServerConfig {
            addr: EndpointAddr::uds(SOCKET_PATH),
            max_conns: 8,
            sink: Rc::new(StdoutSink),
        }
    }
}

/// The log server skeleton.
pub struct LogServer {
    sink: Rc<dyn LogSink>,
}

impl LogServer {
    /// Build the server and bind its listening socket into the chain.
    pub fn create(chain: &Chain, config: LogServerConfig) -> Result<Rc<Assocket>> {
        let server = Rc::new(LogServer { sink: config.sink });
        Assocket::create(
            chain,
            AssocketConfig {
                name: "logserver".to_string(),
                addr: config.addr,
                port: 0,
                pool_size: config.max_conns,
                initial_buf: crate::defaults::RECV_BUFFER_SIZE,
            },
            server,
        )
    }

    fn handle(&self, header: WireHeader, body: &[u8]) -> WireHeader {
        match header.msg_id {
            msg::SAVE_LOG_REQ => match decode_record(body) {
                Ok(record) => {
                    self.sink.save(&record);
                    header.response_to(msg::SAVE_LOG_RESP, results::SUCCESS)
                }
                Err(_) => header.response_to(msg::SAVE_LOG_RESP, results::INVALID_PARAM),
            },
            other => {
                warn!("logserver: unsupported msg id {}", other);
                header.response_to(header.msg_id, results::UNSUPPORTED)
            }
        }
    }
}

impl ServerEvents for LogServer {
    fn on_connect(&self, _srv: &Assocket, conn: ConnId) {
        info!("logserver: client connected on slot {}", conn);
    }

    fn on_data(&self, srv: &Assocket, conn: ConnId, buf: &[u8]) -> DataOutcome {
        consume_frames(buf, MAGIC, |header, body| {
            let resp = self.handle(header, body);
            let out = encode_message(&resp, &[]);
            if let Err(e) = srv.send_copy(conn, &out) {
                warn!("logserver: response send failed: {}", e);
            }
        })
    }
}

/// Body layout: u8 level, three reserved bytes, u16 tag length, u16 text
/// length, tag, then text.
pub fn encode_record(record: &LogRecord) -> Vec<u8> {
    let mut body = Vec::with_capacity(8 + record.tag.len() + record.text.len());
    body.push(record.level);
    body.extend_from_slice(&[0u8; 3]);
    put_u16(&mut body, record.tag.len() as u16);
    put_u16(&mut body, record.text.len() as u16);
    body.extend_from_slice(record.tag.as_bytes());
    body.extend_from_slice(record.text.as_bytes());
    body
}

/// Parse a save-log request body.
pub fn decode_record(body: &[u8]) -> Result<LogRecord> {
    if body.is_empty() {
        return Err(Error::BufferTooSmall);
    }
    let level = body[0];
    let tag_len = get_u16(body, 4)? as usize;
    let text_len = get_u16(body, 6)? as usize;
    if body.len() < 8 + tag_len + text_len {
        return Err(Error::IncompleteData);
    }
    let tag = String::from_utf8(body[8..8 + tag_len].to_vec()).map_err(|_| Error::InvalidData)?;
    let text = String::from_utf8(body[8 + tag_len..8 + tag_len + text_len].to_vec())
        .map_err(|_| Error::InvalidData)?;
    Ok(LogRecord { level, tag, text })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_round_trip() {
        let record = LogRecord {
            level: 3,
            tag: "servmgmt".to_string(),
            text: "service started".to_string(),
        };
        let decoded = decode_record(&encode_record(&record)).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_truncated_record_rejected() {
        let record = LogRecord {
            level: 1,
            tag: "t".to_string(),
            text: "xyz".to_string(),
        };
        let body = encode_record(&record);
        assert!(decode_record(&body[..body.len() - 1]).is_err());
    }
}
