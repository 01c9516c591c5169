use anyhow::Result;
use std::sync::mpsc;
use std::time::Duration;

use ipc_substrate::daemon::configmgr::{
    self, decode_value, encode_get_request, encode_set_request, ConfigMgrConfig, ConfigMgrServer,
};
use ipc_substrate::daemon::proto::{encode_message, results, WireHeader, HEADER_LEN};
use ipc_substrate::net::{Chain, ChainController, EndpointAddr, RawSock};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

fn start_server(path: std::path::PathBuf) -> ChainController {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let chain = Chain::new().unwrap();
        let _server = ConfigMgrServer::create(
            &chain,
            ConfigMgrConfig {
                addr: EndpointAddr::uds(&path),
                ..Default::default()
            },
        )
        .unwrap();
        tx.send(chain.controller()).unwrap();
        chain.run().unwrap();
    });
    rx.recv().unwrap()
}

struct Client {
    sock: RawSock,
    seq: u32,
}

impl Client {
    fn connect(path: &std::path::Path) -> Result<Client> {
        let addr = EndpointAddr::uds(path);
        let sock = RawSock::stream(addr.domain())?;
        sock.connect_with_timeout(&addr, 0, Duration::from_secs(2))?;
        Ok(Client { sock, seq: 0 })
    }

    fn roundtrip(
        &mut self,
        msg_id: u8,
        tx_id: u32,
        body: &[u8],
    ) -> Result<(WireHeader, Vec<u8>)> {
        self.seq += 1;
        let mut header = WireHeader::request(msg_id, configmgr::MAGIC, self.seq);
        header.tx_id = tx_id;
        self.sock.sendn(&encode_message(&header, body))?;

        let mut head = [0u8; HEADER_LEN];
        self.sock.recvn_with_timeout(&mut head, RESPONSE_TIMEOUT)?;
        let header = WireHeader::decode(&head)?;
        let mut body = vec![0u8; header.payload_size as usize];
        if !body.is_empty() {
            self.sock.recvn_with_timeout(&mut body, RESPONSE_TIMEOUT)?;
        }
        Ok((header, body))
    }
}

/// Get of a missing key answers NOT_FOUND with an empty value; after a
/// set, the same get answers the stored value.
#[test]
fn get_set_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("configmgr.sock");
    let controller = start_server(path.clone());
    std::thread::sleep(Duration::from_millis(100));

    let mut client = Client::connect(&path)?;

    let (header, body) =
        client.roundtrip(configmgr::msg::GET_CONFIG_REQ, 0, &encode_get_request("a.b.c"))?;
    assert_eq!(header.msg_id, configmgr::msg::GET_CONFIG_RESP);
    assert_eq!(header.result, results::NOT_FOUND);
    assert_eq!(decode_value(&body)?, "");

    let (header, _) = client.roundtrip(
        configmgr::msg::SET_CONFIG_REQ,
        0,
        &encode_set_request("a.b.c", "v"),
    )?;
    assert_eq!(header.result, results::SUCCESS);

    let (header, body) =
        client.roundtrip(configmgr::msg::GET_CONFIG_REQ, 0, &encode_get_request("a.b.c"))?;
    assert_eq!(header.result, results::SUCCESS);
    assert_eq!(decode_value(&body)?, "v");

    controller.stop().unwrap();
    Ok(())
}

/// Transactions stage sets until commit; rollback discards them.
#[test]
fn transactions_apply_on_commit() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("configmgr_tx.sock");
    let controller = start_server(path.clone());
    std::thread::sleep(Duration::from_millis(100));

    let mut client = Client::connect(&path)?;

    let (header, _) = client.roundtrip(configmgr::msg::START_TRANSACTION_REQ, 0, &[])?;
    assert_eq!(header.result, results::SUCCESS);
    let tx = header.tx_id;
    assert_ne!(tx, 0);

    let (header, _) = client.roundtrip(
        configmgr::msg::SET_CONFIG_REQ,
        tx,
        &encode_set_request("svc.port", "7001"),
    )?;
    assert_eq!(header.result, results::SUCCESS);

    // Outside the transaction the key does not exist yet.
    let (header, _) =
        client.roundtrip(configmgr::msg::GET_CONFIG_REQ, 0, &encode_get_request("svc.port"))?;
    assert_eq!(header.result, results::NOT_FOUND);

    // Inside it, the staged value is visible.
    let (header, body) =
        client.roundtrip(configmgr::msg::GET_CONFIG_REQ, tx, &encode_get_request("svc.port"))?;
    assert_eq!(header.result, results::SUCCESS);
    assert_eq!(decode_value(&body)?, "7001");

    let (header, _) = client.roundtrip(configmgr::msg::COMMIT_TRANSACTION_REQ, tx, &[])?;
    assert_eq!(header.result, results::SUCCESS);

    let (header, body) =
        client.roundtrip(configmgr::msg::GET_CONFIG_REQ, 0, &encode_get_request("svc.port"))?;
    assert_eq!(header.result, results::SUCCESS);
    assert_eq!(decode_value(&body)?, "7001");

    // A rolled-back transaction leaves no trace.
    let (header, _) = client.roundtrip(configmgr::msg::START_TRANSACTION_REQ, 0, &[])?;
    let tx = header.tx_id;
    client.roundtrip(
        configmgr::msg::SET_CONFIG_REQ,
        tx,
        &encode_set_request("svc.host", "nowhere"),
    )?;
    let (header, _) = client.roundtrip(configmgr::msg::ROLLBACK_TRANSACTION_REQ, tx, &[])?;
    assert_eq!(header.result, results::SUCCESS);
    let (header, _) =
        client.roundtrip(configmgr::msg::GET_CONFIG_REQ, 0, &encode_get_request("svc.host"))?;
    assert_eq!(header.result, results::NOT_FOUND);

    controller.stop().unwrap();
    Ok(())
}
