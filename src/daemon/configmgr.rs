//! # Config Manager
//!
//! The configuration daemon's core: a tree of dotted-name settings with
//! optional transactions, and the request/response server skeleton that
//! exposes it over the daemon's Unix-domain socket.
//!
//! Names are dotted paths (`a.b.c`); every node may carry a value and
//! children at the same time. A transaction stages set operations in
//! order and applies them atomically on commit; reads inside a
//! transaction see the staged values first.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, info, warn};

use super::proto::{consume_frames, encode_message, get_u16, put_u16, results, WireHeader};
use crate::error::{Error, Result};
use crate::net::{
    Assocket, AssocketConfig, Chain, ConnId, DataOutcome, DisconnectReason, EndpointAddr,
    ServerEvents,
};

/// Magic number of the config manager protocol ("CFMR").
pub const MAGIC: u32 = 0x4346_4D52;

/// Default socket path of the config manager daemon.
pub const SOCKET_PATH: &str = "/tmp/configmgr_server";

/// Message ids of the config manager protocol.
pub mod msg {
    pub const GET_CONFIG_REQ: u8 = 1;
    pub const GET_CONFIG_RESP: u8 = 2;
    pub const SET_CONFIG_REQ: u8 = 3;
    pub const SET_CONFIG_RESP: u8 = 4;
    pub const START_TRANSACTION_REQ: u8 = 5;
    pub const START_TRANSACTION_RESP: u8 = 6;
    pub const COMMIT_TRANSACTION_REQ: u8 = 7;
    pub const COMMIT_TRANSACTION_RESP: u8 = 8;
    pub const ROLLBACK_TRANSACTION_REQ: u8 = 9;
    pub const ROLLBACK_TRANSACTION_RESP: u8 = 10;
}

/// Upper bound on a config name or value on the wire.
pub const MAX_STRING_LEN: usize = 512;

#[derive(Default)]
struct Node {
    value: Option<String>,
    children: BTreeMap<String, Node>,
}

struct Transaction {
    id: u32,
    staged: Vec<(String, String)>,
}

/// In-memory tree of dotted-name settings with bounded transactions.
pub struct ConfigTree {
    root: Node,
    transactions: Vec<Transaction>,
    max_transactions: usize,
    next_tx_id: u32,
}

fn split_name(name: &str) -> Result<Vec<&str>> {
    if name.is_empty() || name.len() > MAX_STRING_LEN {
        return Err(Error::InvalidParam("config name empty or too long"));
    }
    let parts: Vec<&str> = name.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(Error::InvalidParam("config name has an empty segment"));
    }
    Ok(parts)
}

impl ConfigTree {
    /// Create an empty tree allowing up to `max_transactions` concurrent
    /// transactions.
    pub fn new(max_transactions: usize) -> ConfigTree {
        ConfigTree {
            root: Node::default(),
            transactions: Vec::new(),
            max_transactions,
            next_tx_id: 1,
        }
    }

    /// Value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        let parts = split_name(name).ok()?;
        let mut node = &self.root;
        for part in parts {
            node = node.children.get(part)?;
        }
        node.value.as_deref()
    }

    /// Store `value` under `name`, creating intermediate nodes.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        if value.len() > MAX_STRING_LEN {
            return Err(Error::InvalidParam("config value too long"));
        }
        let parts = split_name(name)?;
        let mut node = &mut self.root;
        for part in parts {
            node = node.children.entry(part.to_string()).or_default();
        }
        node.value = Some(value.to_string());
        Ok(())
    }

    /// Open a transaction; fails when the transaction table is full.
    pub fn start_transaction(&mut self) -> Result<u32> {
        if self.transactions.len() >= self.max_transactions {
            return Err(Error::ReachMaxResources);
        }
        let id = self.next_tx_id;
        self.next_tx_id = self.next_tx_id.wrapping_add(1).max(1);
        self.transactions.push(Transaction {
            id,
            staged: Vec::new(),
        });
        debug!("config transaction {} started", id);
        Ok(id)
    }

    /// Stage a set inside transaction `tx`.
    pub fn transaction_set(&mut self, tx: u32, name: &str, value: &str) -> Result<()> {
        split_name(name)?;
        if value.len() > MAX_STRING_LEN {
            return Err(Error::InvalidParam("config value too long"));
        }
        let txn = self
            .transactions
            .iter_mut()
            .find(|t| t.id == tx)
            .ok_or(Error::InvalidParam("unknown transaction"))?;
        txn.staged.push((name.to_string(), value.to_string()));
        Ok(())
    }

    /// Read inside transaction `tx`: staged values shadow the tree.
    pub fn transaction_get(&self, tx: u32, name: &str) -> Option<String> {
        if let Some(txn) = self.transactions.iter().find(|t| t.id == tx) {
            if let Some((_, value)) = txn.staged.iter().rev().find(|(n, _)| n == name) {
                return Some(value.clone());
            }
        }
        self.get(name).map(str::to_string)
    }

    /// Apply every staged set of `tx` in order and close it.
    pub fn commit_transaction(&mut self, tx: u32) -> Result<()> {
        let pos = self
            .transactions
            .iter()
            .position(|t| t.id == tx)
            .ok_or(Error::InvalidParam("unknown transaction"))?;
        let txn = self.transactions.remove(pos);
        for (name, value) in &txn.staged {
            self.set(name, value)?;
        }
        debug!("config transaction {} committed, {} sets", tx, txn.staged.len());
        Ok(())
    }

    /// Discard transaction `tx`.
    pub fn rollback_transaction(&mut self, tx: u32) -> Result<()> {
        let pos = self
            .transactions
            .iter()
            .position(|t| t.id == tx)
            .ok_or(Error::InvalidParam("unknown transaction"))?;
        self.transactions.remove(pos);
        debug!("config transaction {} rolled back", tx);
        Ok(())
    }

    /// Number of open transactions.
    pub fn open_transactions(&self) -> usize {
        self.transactions.len()
    }
}

/// Parameters for the config manager server.
#[derive(Clone)]
pub struct ConfigMgrConfig {
    /// Listening endpoint.
    pub addr: EndpointAddr,
    /// Concurrent client connections served.
    pub max_conns: usize,
    /// Concurrent transactions allowed.
    pub max_transactions: usize,
}

impl Default for ConfigMgrConfig {
    fn default() -> Self {
        ConfigMgrConfig {
            addr: EndpointAddr::uds(SOCKET_PATH),
            max_conns: 3,
            max_transactions: 10,
        }
    }
}

/// The config manager server skeleton: tree plus protocol handler.
pub struct ConfigMgrServer {
    tree: RefCell<ConfigTree>,
}

impl ConfigMgrServer {
    /// Build the server and bind its listening socket into the chain.
    pub fn create(chain: &Chain, config: ConfigMgrConfig) -> Result<Rc<Assocket>> {
        let server = Rc::new(ConfigMgrServer {
            tree: RefCell::new(ConfigTree::new(config.max_transactions)),
        });
        Assocket::create(
            chain,
            AssocketConfig {
                name: "configmgr".to_string(),
                addr: config.addr,
                port: 0,
                pool_size: config.max_conns,
                initial_buf: crate::defaults::RECV_BUFFER_SIZE,
            },
            server,
        )
    }

    fn handle(&self, header: WireHeader, body: &[u8]) -> (WireHeader, Vec<u8>) {
        match header.msg_id {
            msg::GET_CONFIG_REQ => self.handle_get(header, body),
            msg::SET_CONFIG_REQ => self.handle_set(header, body),
            msg::START_TRANSACTION_REQ => self.handle_start_tx(header),
            msg::COMMIT_TRANSACTION_REQ => self.handle_commit_tx(header),
            msg::ROLLBACK_TRANSACTION_REQ => self.handle_rollback_tx(header),
            other => {
                warn!("configmgr: unsupported msg id {}", other);
                (
                    header.response_to(header.msg_id, results::UNSUPPORTED),
                    Vec::new(),
                )
            }
        }
    }

    fn handle_get(&self, header: WireHeader, body: &[u8]) -> (WireHeader, Vec<u8>) {
        let name = match read_name(body) {
            Ok(name) => name,
            Err(_) => {
                return (
                    header.response_to(msg::GET_CONFIG_RESP, results::INVALID_PARAM),
                    encode_value(""),
                )
            }
        };
        let value = if header.tx_id != 0 {
            self.tree.borrow().transaction_get(header.tx_id, &name)
        } else {
            self.tree.borrow().get(&name).map(str::to_string)
        };
        debug!("configmgr: get {} -> {:?}", name, value.is_some());
        match value {
            Some(value) => (
                header.response_to(msg::GET_CONFIG_RESP, results::SUCCESS),
                encode_value(&value),
            ),
            None => (
                header.response_to(msg::GET_CONFIG_RESP, results::NOT_FOUND),
                encode_value(""),
            ),
        }
    }

    fn handle_set(&self, header: WireHeader, body: &[u8]) -> (WireHeader, Vec<u8>) {
        let parsed = read_name_value(body);
        let result = match parsed {
            Ok((name, value)) => {
                debug!("configmgr: set {}", name);
                let outcome = if header.tx_id != 0 {
                    self.tree
                        .borrow_mut()
                        .transaction_set(header.tx_id, &name, &value)
                } else {
                    self.tree.borrow_mut().set(&name, &value)
                };
                match outcome {
                    Ok(()) => results::SUCCESS,
                    Err(_) => results::INVALID_PARAM,
                }
            }
            Err(_) => results::INVALID_PARAM,
        };
        (header.response_to(msg::SET_CONFIG_RESP, result), Vec::new())
    }

    fn handle_start_tx(&self, header: WireHeader) -> (WireHeader, Vec<u8>) {
        match self.tree.borrow_mut().start_transaction() {
            Ok(id) => {
                let mut resp = header.response_to(msg::START_TRANSACTION_RESP, results::SUCCESS);
                resp.tx_id = id;
                (resp, Vec::new())
            }
            Err(_) => (
                header.response_to(msg::START_TRANSACTION_RESP, results::MAX_RESOURCES),
                Vec::new(),
            ),
        }
    }

    fn handle_commit_tx(&self, header: WireHeader) -> (WireHeader, Vec<u8>) {
        let result = match self.tree.borrow_mut().commit_transaction(header.tx_id) {
            Ok(()) => results::SUCCESS,
            Err(_) => results::NOT_FOUND,
        };
        (
            header.response_to(msg::COMMIT_TRANSACTION_RESP, result),
            Vec::new(),
        )
    }

    fn handle_rollback_tx(&self, header: WireHeader) -> (WireHeader, Vec<u8>) {
        let result = match self.tree.borrow_mut().rollback_transaction(header.tx_id) {
            Ok(()) => results::SUCCESS,
            Err(_) => results::NOT_FOUND,
        };
        (
            header.response_to(msg::ROLLBACK_TRANSACTION_RESP, result),
            Vec::new(),
        )
    }
}

impl ServerEvents for ConfigMgrServer {
    fn on_connect(&self, _srv: &Assocket, conn: ConnId) {
        info!("configmgr: client connected on slot {}", conn);
    }

    fn on_data(&self, srv: &Assocket, conn: ConnId, buf: &[u8]) -> DataOutcome {
        consume_frames(buf, MAGIC, |header, body| {
            let (resp_header, resp_body) = self.handle(header, body);
            let out = encode_message(&resp_header, &resp_body);
            if let Err(e) = srv.send_copy(conn, &out) {
                warn!("configmgr: response send failed: {}", e);
            }
        })
    }

    fn on_disconnect(&self, _srv: &Assocket, conn: ConnId, _reason: DisconnectReason) {
        info!("configmgr: client on slot {} disconnected", conn);
    }
}

/// Body layout: u16 length, six reserved bytes, then the string.
fn read_name(body: &[u8]) -> Result<String> {
    let len = get_u16(body, 0)? as usize;
    if body.len() < 8 + len {
        return Err(Error::IncompleteData);
    }
    String::from_utf8(body[8..8 + len].to_vec()).map_err(|_| Error::InvalidData)
}

/// Body layout: u16 name length, u16 value length, four reserved bytes,
/// name, then value.
fn read_name_value(body: &[u8]) -> Result<(String, String)> {
    let name_len = get_u16(body, 0)? as usize;
    let value_len = get_u16(body, 2)? as usize;
    if body.len() < 8 + name_len + value_len {
        return Err(Error::IncompleteData);
    }
    let name = String::from_utf8(body[8..8 + name_len].to_vec()).map_err(|_| Error::InvalidData)?;
    let value = String::from_utf8(body[8 + name_len..8 + name_len + value_len].to_vec())
        .map_err(|_| Error::InvalidData)?;
    Ok((name, value))
}

/// Encode a get-response body.
fn encode_value(value: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(8 + value.len());
    put_u16(&mut body, value.len() as u16);
    body.extend_from_slice(&[0u8; 6]);
    body.extend_from_slice(value.as_bytes());
    body
}

/// Encode a get-request body for `name`.
pub fn encode_get_request(name: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(8 + name.len());
    put_u16(&mut body, name.len() as u16);
    body.extend_from_slice(&[0u8; 6]);
    body.extend_from_slice(name.as_bytes());
    body
}

/// Encode a set-request body for `name` = `value`.
pub fn encode_set_request(name: &str, value: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(8 + name.len() + value.len());
    put_u16(&mut body, name.len() as u16);
    put_u16(&mut body, value.len() as u16);
    body.extend_from_slice(&[0u8; 4]);
    body.extend_from_slice(name.as_bytes());
    body.extend_from_slice(value.as_bytes());
    body
}

/// Decode a get-response body back into the value string.
pub fn decode_value(body: &[u8]) -> Result<String> {
    let len = get_u16(body, 0)? as usize;
    if body.len() < 8 + len {
        return Err(Error::IncompleteData);
    }
    String::from_utf8(body[8..8 + len].to_vec()).map_err(|_| Error::InvalidData)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_get_set() {
        let mut tree = ConfigTree::new(4);
        assert!(tree.get("a.b.c").is_none());
        tree.set("a.b.c", "v").unwrap();
        assert_eq!(tree.get("a.b.c"), Some("v"));
        // Intermediate nodes exist but carry no value.
        assert!(tree.get("a.b").is_none());
        tree.set("a.b", "w").unwrap();
        assert_eq!(tree.get("a.b"), Some("w"));
        assert_eq!(tree.get("a.b.c"), Some("v"));
    }

    #[test]
    fn test_tree_rejects_bad_names() {
        let mut tree = ConfigTree::new(4);
        assert!(tree.set("", "v").is_err());
        assert!(tree.set("a..b", "v").is_err());
        assert!(tree.get("").is_none());
    }

    #[test]
    fn test_transaction_commit_applies_in_order() {
        let mut tree = ConfigTree::new(4);
        tree.set("k", "old").unwrap();
        let tx = tree.start_transaction().unwrap();
        tree.transaction_set(tx, "k", "mid").unwrap();
        tree.transaction_set(tx, "k", "new").unwrap();

        // Staged values shadow the tree inside the transaction only.
        assert_eq!(tree.transaction_get(tx, "k").as_deref(), Some("new"));
        assert_eq!(tree.get("k"), Some("old"));

        tree.commit_transaction(tx).unwrap();
        assert_eq!(tree.get("k"), Some("new"));
        assert_eq!(tree.open_transactions(), 0);
    }

    #[test]
    fn test_transaction_rollback_discards() {
        let mut tree = ConfigTree::new(4);
        let tx = tree.start_transaction().unwrap();
        tree.transaction_set(tx, "x", "1").unwrap();
        tree.rollback_transaction(tx).unwrap();
        assert!(tree.get("x").is_none());
        assert!(tree.commit_transaction(tx).is_err());
    }

    #[test]
    fn test_transaction_table_bounded() {
        let mut tree = ConfigTree::new(2);
        tree.start_transaction().unwrap();
        tree.start_transaction().unwrap();
        assert!(matches!(
            tree.start_transaction(),
            Err(Error::ReachMaxResources)
        ));
    }

    #[test]
    fn test_request_body_round_trip() {
        let body = encode_set_request("a.b", "v");
        let (name, value) = read_name_value(&body).unwrap();
        assert_eq!(name, "a.b");
        assert_eq!(value, "v");

        let body = encode_get_request("a.b");
        assert_eq!(read_name(&body).unwrap(), "a.b");

        let body = encode_value("hello");
        assert_eq!(decode_value(&body).unwrap(), "hello");
    }
}
