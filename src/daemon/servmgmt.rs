//! # Service Manager
//!
//! The service-management daemon's skeleton: a small in-memory table of
//! managed services and the request/response surface over it. Actual
//! process supervision (spawning and restart policy) is an outer layer;
//! the skeleton tracks declared services and their reported status.

use std::cell::RefCell;
use std::rc::Rc;
use tracing::{info, warn};

use super::proto::{consume_frames, encode_message, get_u16, put_u16, results, WireHeader};
use crate::error::{Error, Result};
use crate::net::{
    Assocket, AssocketConfig, Chain, ConnId, DataOutcome, EndpointAddr, ServerEvents,
};

/// Magic number of the service manager protocol ("SERV").
pub const MAGIC: u32 = 0x5345_5256;

/// Default socket path of the service manager daemon.
pub const SOCKET_PATH: &str = "/tmp/servmgmt_server";

/// Message ids of the service manager protocol.
pub mod msg {
    pub const GET_INFO_REQ: u8 = 1;
    pub const GET_INFO_RESP: u8 = 2;
    pub const START_SERV_REQ: u8 = 3;
    pub const START_SERV_RESP: u8 = 4;
    pub const STOP_SERV_REQ: u8 = 5;
    pub const STOP_SERV_RESP: u8 = 6;
}

/// How a service is brought up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupType {
    /// Started when the daemon starts.
    Automatic = 0,
    /// Started on request only.
    Manual = 1,
}

/// Reported state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServStatus {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Error = 3,
}

/// One managed service.
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    pub name: String,
    pub startup: StartupType,
    pub status: ServStatus,
}

/// In-memory table of managed services.
pub struct ServiceTable {
    services: Vec<ServiceEntry>,
}

impl ServiceTable {
    /// Table over a declared service list; automatic services start out
    /// running.
    pub fn new(declared: Vec<(String, StartupType)>) -> ServiceTable {
        let services = declared
            .into_iter()
            .map(|(name, startup)| ServiceEntry {
                name,
                startup,
                status: match startup {
                    StartupType::Automatic => ServStatus::Running,
                    StartupType::Manual => ServStatus::Stopped,
                },
            })
            .collect();
        ServiceTable { services }
    }

    /// Look up a service by name.
    pub fn get(&self, name: &str) -> Option<&ServiceEntry> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Mark a service running.
    pub fn start(&mut self, name: &str) -> Result<()> {
        let entry = self
            .services
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or(Error::InvalidParam("unknown service"))?;
        entry.status = ServStatus::Running;
        Ok(())
    }

    /// Mark a service stopped.
    pub fn stop(&mut self, name: &str) -> Result<()> {
        let entry = self
            .services
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or(Error::InvalidParam("unknown service"))?;
        entry.status = ServStatus::Stopped;
        Ok(())
    }
}

/// Parameters for the service manager server.
pub struct ServMgmtConfig {
    /// Listening endpoint.
    pub addr: EndpointAddr,
    /// Concurrent client connections served.
    pub max_conns: usize,
    /// Declared services.
    pub services: Vec<(String, StartupType)>,
}

impl Default for ServMgmtConfig {
    fn default() -> Self {
        ServMgmtConfig {
            addr: EndpointAddr::uds(SOCKET_PATH),
            max_conns: 3,
            services: Vec::new(),
        }
    }
}

/// The service manager server skeleton.
pub struct ServMgmtServer {
    table: RefCell<ServiceTable>,
}

impl ServMgmtServer {
    /// Build the server and bind its listening socket into the chain.
    pub fn create(chain: &Chain, config: ServMgmtConfig) -> Result<Rc<Assocket>> {
        let server = Rc::new(ServMgmtServer {
            table: RefCell::new(ServiceTable::new(config.services)),
        });
        Assocket::create(
            chain,
            AssocketConfig {
                name: "servmgmt".to_string(),
                addr: config.addr,
                port: 0,
                pool_size: config.max_conns,
                initial_buf: crate::defaults::RECV_BUFFER_SIZE,
            },
            server,
        )
    }

    fn handle(&self, header: WireHeader, body: &[u8]) -> (WireHeader, Vec<u8>) {
        let name = match read_service_name(body) {
            Ok(name) => name,
            Err(_) => {
                return (
                    header.response_to(header.msg_id, results::INVALID_PARAM),
                    Vec::new(),
                )
            }
        };
        match header.msg_id {
            msg::GET_INFO_REQ => match self.table.borrow().get(&name) {
                Some(entry) => (
                    header.response_to(msg::GET_INFO_RESP, results::SUCCESS),
                    encode_info(entry),
                ),
                None => (
                    header.response_to(msg::GET_INFO_RESP, results::NOT_FOUND),
                    Vec::new(),
                ),
            },
            msg::START_SERV_REQ => {
                info!("servmgmt: start request for {}", name);
                let result = match self.table.borrow_mut().start(&name) {
                    Ok(()) => results::SUCCESS,
                    Err(_) => results::NOT_FOUND,
                };
                (header.response_to(msg::START_SERV_RESP, result), Vec::new())
            }
            msg::STOP_SERV_REQ => {
                info!("servmgmt: stop request for {}", name);
                let result = match self.table.borrow_mut().stop(&name) {
                    Ok(()) => results::SUCCESS,
                    Err(_) => results::NOT_FOUND,
                };
                (header.response_to(msg::STOP_SERV_RESP, result), Vec::new())
            }
            other => {
                warn!("servmgmt: unsupported msg id {}", other);
                (
                    header.response_to(header.msg_id, results::UNSUPPORTED),
                    Vec::new(),
                )
            }
        }
    }
}

impl ServerEvents for ServMgmtServer {
    fn on_data(&self, srv: &Assocket, conn: ConnId, buf: &[u8]) -> DataOutcome {
        consume_frames(buf, MAGIC, |header, body| {
            let (resp_header, resp_body) = self.handle(header, body);
            let out = encode_message(&resp_header, &resp_body);
            if let Err(e) = srv.send_copy(conn, &out) {
                warn!("servmgmt: response send failed: {}", e);
            }
        })
    }
}

/// Request body layout: u16 name length, six reserved bytes, name.
pub fn encode_service_name(name: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(8 + name.len());
    put_u16(&mut body, name.len() as u16);
    body.extend_from_slice(&[0u8; 6]);
    body.extend_from_slice(name.as_bytes());
    body
}

fn read_service_name(body: &[u8]) -> Result<String> {
    let len = get_u16(body, 0)? as usize;
    if len == 0 || body.len() < 8 + len {
        return Err(Error::InvalidParam("bad service name"));
    }
    String::from_utf8(body[8..8 + len].to_vec()).map_err(|_| Error::InvalidData)
}

/// Info-response body layout: u8 startup type, u8 status, six reserved
/// bytes.
fn encode_info(entry: &ServiceEntry) -> Vec<u8> {
    let mut body = vec![entry.startup as u8, entry.status as u8];
    body.extend_from_slice(&[0u8; 6]);
    body
}

/// Parse an info-response body.
pub fn decode_info(body: &[u8]) -> Result<(StartupType, ServStatus)> {
    if body.len() < 8 {
        return Err(Error::BufferTooSmall);
    }
    let startup = match body[0] {
        0 => StartupType::Automatic,
        1 => StartupType::Manual,
        _ => return Err(Error::InvalidData),
    };
    let status = match body[1] {
        0 => ServStatus::Stopped,
        1 => ServStatus::Starting,
        2 => ServStatus::Running,
        3 => ServStatus::Error,
        _ => return Err(Error::InvalidData),
    };
    Ok((startup, status))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ServiceTable {
        ServiceTable::new(vec![
            ("collector".to_string(), StartupType::Automatic),
            ("archiver".to_string(), StartupType::Manual),
        ])
    }

    #[test]
    fn test_automatic_services_start_running() {
        let table = table();
        assert_eq!(table.get("collector").unwrap().status, ServStatus::Running);
        assert_eq!(table.get("archiver").unwrap().status, ServStatus::Stopped);
    }

    #[test]
    fn test_start_stop_flips_status() {
        let mut table = table();
        table.start("archiver").unwrap();
        assert_eq!(table.get("archiver").unwrap().status, ServStatus::Running);
        table.stop("archiver").unwrap();
        assert_eq!(table.get("archiver").unwrap().status, ServStatus::Stopped);
        assert!(table.start("nonexistent").is_err());
    }

    #[test]
    fn test_info_body_round_trip() {
        let table = table();
        let body = encode_info(table.get("archiver").unwrap());
        let (startup, status) = decode_info(&body).unwrap();
        assert_eq!(startup, StartupType::Manual);
        assert_eq!(status, ServStatus::Stopped);
    }
}
