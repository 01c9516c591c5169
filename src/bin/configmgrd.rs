//! Config manager daemon: serves the config tree over its Unix-domain
//! socket.

use anyhow::Result;
use clap::Parser;
use tracing::info;

use ipc_substrate::daemon::configmgr::{ConfigMgrConfig, ConfigMgrServer};
use ipc_substrate::daemon::runtime::{self, DaemonOpts};
use ipc_substrate::net::{Chain, EndpointAddr};

const PROGRAM: &str = "configmgrd";

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    if !opts.foreground {
        // Detach before any file descriptors worth keeping exist.
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
    let mut config = ConfigMgrConfig::default();
    if let Some(path) = settings.socket_path {
        config.addr = EndpointAddr::uds(path);
    }
    if let Some(max_conns) = settings.max_conns {
        config.max_conns = max_conns;
    }

    let chain = Chain::new()?;
    let _server = ConfigMgrServer::create(&chain, config)?;
    info!("{} v{} serving", PROGRAM, ipc_substrate::VERSION);
    chain.run()?;

    runtime::remove_pid_file(&pid_file);
    Ok(())
}
