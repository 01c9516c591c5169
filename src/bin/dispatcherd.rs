//! Message dispatcher daemon.
//!
//! Accepts messaging-framed messages on its Unix-domain socket and relays
//! each to the destination endpoint named in the message header, one
//! transfer queue per destination. Reserved message ids are infrastructure
//! traffic and are never relayed to user endpoints.

use anyhow::Result;
use clap::Parser;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, info, warn};

use ipc_substrate::daemon::runtime::{self, DaemonOpts};
use ipc_substrate::dispatcher::{self, message, DispatcherMsg, Xfer, XferConfig};
use ipc_substrate::net::{
    Assocket, AssocketConfig, Chain, ConnId, DataOutcome, EndpointAddr, ServerEvents,
};

const PROGRAM: &str = "dispatcherd";

/// Inbound socket the dispatcher serves, under the dispatcher directory.
const SERVER_SOCKET: &str = "/tmp/dispatcher/dispatcher_server";

/// Accepts framed messages and relays them through per-destination
/// transfer queues.
struct Relay {
    chain: Rc<Chain>,
    max_queued: u32,
    xfers: RefCell<HashMap<i32, Rc<Xfer>>>,
}

impl Relay {
    fn xfer_for(&self, destination: i32) -> ipc_substrate::Result<Rc<Xfer>> {
        if let Some(xfer) = self.xfers.borrow().get(&destination) {
            return Ok(xfer.clone());
        }
        let endpoint = EndpointAddr::uds(format!("{}/{}", dispatcher::UDS_DIR, destination));
        let mut config = XferConfig::new(&format!("dest-{}", destination), endpoint, 0);
        config.max_num_msgs = self.max_queued;
        let xfer = Xfer::create(&self.chain, config)?;
        self.xfers
            .borrow_mut()
            .insert(destination, xfer.clone());
        Ok(xfer)
    }

    fn relay(&self, msg: DispatcherMsg) {
        if msg.is_reserved() {
            debug!("dispatcher: dropping reserved msg {:#x}", msg.msg_id());
            return;
        }
        let destination = msg.destination_id();
        match self.xfer_for(destination) {
            Ok(xfer) => {
                if let Err(e) = xfer.send(msg) {
                    warn!("dispatcher: queue for {} rejected msg: {}", destination, e);
                }
            }
            Err(e) => warn!("dispatcher: no transfer for {}: {}", destination, e),
        }
    }
}

impl ServerEvents for Relay {
    fn on_connect(&self, _srv: &Assocket, conn: ConnId) {
        info!("dispatcher: client connected on slot {}", conn);
    }

    fn on_data(&self, _srv: &Assocket, _conn: ConnId, buf: &[u8]) -> DataOutcome {
        let mut off = 0;
        while buf.len() - off >= message::HEADER_SIZE {
            let total = message::total_size(&buf[off..]);
            if buf.len() - off < total {
                break;
            }
            match DispatcherMsg::create(&buf[off..off + total]) {
                Ok(msg) => self.relay(msg),
                Err(_) => return DataOutcome::Invalid,
            }
            off += total;
        }
        if off > 0 {
            DataOutcome::Consumed(off)
        } else {
            DataOutcome::NeedMore
        }
    }
}

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    if !opts.foreground {
        if unsafe { libc::daemon(0, 0) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    let _log_guard = runtime::init_logging(&opts, PROGRAM);

    let pid_file = runtime::pid_file_path(PROGRAM);
    runtime::check_already_running(&pid_file, PROGRAM)?;
    runtime::write_pid_file(&pid_file)?;

    let settings = match opts.setting_file.as_deref() {
        Some(path) => runtime::load_settings(path)?,
        None => Default::default(),
    };

    dispatcher::ensure_uds_dir(dispatcher::UDS_DIR)?;

    let chain = Chain::new()?;
    let relay = Rc::new(Relay {
        chain: chain.clone(),
        max_queued: settings
            .max_queued_msgs
            .unwrap_or(ipc_substrate::defaults::MAX_QUEUED_MSGS),
        xfers: RefCell::new(HashMap::new()),
    });
    let _server = Assocket::create(
        &chain,
        AssocketConfig {
            name: "dispatcher".to_string(),
            addr: EndpointAddr::uds(SERVER_SOCKET),
            port: 0,
            pool_size: settings
                .max_conns
                .unwrap_or(ipc_substrate::defaults::SERVER_POOL_SIZE),
            initial_buf: settings
                .buffer_size
                .unwrap_or(ipc_substrate::defaults::RECV_BUFFER_SIZE),
        },
        relay,
    )?;

    info!("{} v{} serving", PROGRAM, ipc_substrate::VERSION);
    chain.run()?;

    runtime::remove_pid_file(&pid_file);
    Ok(())
}
