use anyhow::Result;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use ipc_substrate::dispatcher::message::{init_header, HEADER_SIZE, PRIO_MID};
use ipc_substrate::dispatcher::xferpool::STATE_IDLE;
use ipc_substrate::dispatcher::{DispatcherMsg, Xfer, XferConfig};
use ipc_substrate::hsm::StateId;
use ipc_substrate::net::{Chain, EndpointAddr, RawSock, Utimer};

fn make_msg(id: u32, payload: &[u8]) -> DispatcherMsg {
    let mut buf = vec![0u8; HEADER_SIZE + payload.len()];
    init_header(&mut buf, id, PRIO_MID, payload.len() as u32).unwrap();
    buf[HEADER_SIZE..].copy_from_slice(payload);
    DispatcherMsg::create(&buf).unwrap()
}

const FIRST_PAYLOAD: &[u8] = b"first-payload";
const SECOND_PAYLOAD: &[u8] = b"second-payload";

/// The full transfer-engine scenario: two messages queued toward a dead
/// Unix-domain endpoint, connect retries pacing at 1 then 2 seconds, a
/// listener appearing mid-retry, both messages delivered in order over
/// one connection, and the engine settling in IDLE with its idle timer
/// armed.
#[test]
fn xfer_retries_then_delivers_in_order() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("xfer_dest.sock");
    let addr = EndpointAddr::uds(&path);

    // Sampled on the chain thread shortly before shutdown.
    let sample: Arc<Mutex<Option<(Option<StateId>, bool)>>> = Arc::new(Mutex::new(None));
    let sample_in_chain = Arc::clone(&sample);

    let (ctl_tx, ctl_rx) = mpsc::channel();
    let (sender_tx, sender_rx) = mpsc::channel();
    let chain_addr = addr.clone();
    std::thread::spawn(move || {
        let chain = Chain::new().unwrap();
        let xfer = Xfer::create(&chain, XferConfig::new("delivery", chain_addr, 0)).unwrap();
        sender_tx.send(xfer.sender()).unwrap();

        let probe = Utimer::new(&chain, "probe");
        let pool = xfer.pool();
        probe.add(1, Duration::from_millis(4600), move || {
            *sample_in_chain.lock().unwrap() =
                Some((pool.object_state(), pool.idle_timer_armed()));
        });

        ctl_tx.send(chain.controller()).unwrap();
        chain.run().unwrap();
    });

    let controller = ctl_rx.recv()?;
    let sender = sender_rx.recv()?;

    // Nothing is listening yet; both sends only queue.
    let first = make_msg(1, FIRST_PAYLOAD);
    let second = make_msg(2, SECOND_PAYLOAD);
    sender.send(first.clone())?;
    sender.send(second.clone())?;

    // Connect attempts fail immediately, then retry after 1 s and 2 s.
    // Bring the destination up between the second and third attempt.
    std::thread::sleep(Duration::from_millis(2100));
    let listener = RawSock::stream(addr.domain())?;
    listener.bind(&addr, 0)?;
    listener.listen(2)?;

    let expected_len = 2 * HEADER_SIZE + FIRST_PAYLOAD.len() + SECOND_PAYLOAD.len();
    let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let received_in_reader = Arc::clone(&received);
    let reader = std::thread::spawn(move || {
        if let Ok((conn, _)) = listener.accept() {
            let mut buf = [0u8; 512];
            while let Ok(n) = conn.recv(&mut buf) {
                if n == 0 {
                    break;
                }
                let mut sink = received_in_reader.lock().unwrap();
                sink.extend_from_slice(&buf[..n]);
                if sink.len() >= expected_len {
                    break;
                }
            }
        }
    });

    // Wait past the probe sample, then shut down.
    std::thread::sleep(Duration::from_millis(2900));
    controller.stop().unwrap();
    reader.join().unwrap();

    // Both messages arrived back to back, in order.
    let bytes = received.lock().unwrap().clone();
    let mut expected = first.bytes().to_vec();
    expected.extend_from_slice(second.bytes());
    assert_eq!(bytes, expected);

    // Queue entries were released; the test clones are the last handles.
    assert_eq!(sender.queued(), 0);
    assert_eq!(first.ref_count(), 1);
    assert_eq!(second.ref_count(), 1);

    // The engine settled in IDLE with the idle timer armed.
    let sampled = sample.lock().unwrap().take().expect("probe fired");
    assert_eq!(sampled.0, Some(STATE_IDLE));
    assert!(sampled.1, "idle timer should be armed");
    Ok(())
}

/// A paused queue holds messages back; resume releases them.
#[test]
fn pause_holds_delivery_until_resume() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("xfer_pause.sock");
    let addr = EndpointAddr::uds(&path);

    let listener = RawSock::stream(addr.domain())?;
    listener.bind(&addr, 0)?;
    listener.listen(2)?;

    let (ctl_tx, ctl_rx) = mpsc::channel();
    let (sender_tx, sender_rx) = mpsc::channel();
    let chain_addr = addr.clone();
    std::thread::spawn(move || {
        let chain = Chain::new().unwrap();
        let xfer = Xfer::create(&chain, XferConfig::new("paused", chain_addr, 0)).unwrap();
        sender_tx.send(xfer.sender()).unwrap();
        ctl_tx.send(chain.controller()).unwrap();
        chain.run().unwrap();
    });
    let controller = ctl_rx.recv()?;
    let sender = sender_rx.recv()?;

    sender.pause();
    sender.send(make_msg(7, b"held"))?;
    std::thread::sleep(Duration::from_millis(300));
    // Still queued: the pool never saw the message.
    assert_eq!(sender.queued(), 1);

    let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let received_in_reader = Arc::clone(&received);
    let reader = std::thread::spawn(move || {
        if let Ok((conn, _)) = listener.accept() {
            let mut buf = [0u8; 256];
            while let Ok(n) = conn.recv(&mut buf) {
                if n == 0 {
                    break;
                }
                let mut sink = received_in_reader.lock().unwrap();
                sink.extend_from_slice(&buf[..n]);
                if sink.len() >= HEADER_SIZE + 4 {
                    break;
                }
            }
        }
    });

    sender.resume();
    std::thread::sleep(Duration::from_millis(500));
    controller.stop().unwrap();
    reader.join().unwrap();

    assert_eq!(sender.queued(), 0);
    let bytes = received.lock().unwrap().clone();
    assert_eq!(&bytes[HEADER_SIZE..], b"held");
    Ok(())
}
