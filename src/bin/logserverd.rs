//! Log-collection daemon: accepts save-log requests and writes them to
//! the configured sink.

use anyhow::Result;
use clap::Parser;
use tracing::info;

use ipc_substrate::daemon::logserver::{LogServer, LogServerConfig};
use ipc_substrate::daemon::runtime::{self, DaemonOpts};
use ipc_substrate::net::{Chain, EndpointAddr};

const PROGRAM: &str = "logserverd";

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
    let mut config = LogServerConfig::default();
    if let Some(path) = settings.socket_path {
        config.addr = EndpointAddr::uds(path);
    }
    if let Some(max_conns) = settings.max_conns {
        config.max_conns = max_conns;
    }

    let chain = Chain::new()?;
    let _server = LogServer::create(&chain, config)?;
    info!("{} v{} serving", PROGRAM, ipc_substrate::VERSION);
    chain.run()?;

    runtime::remove_pid_file(&pid_file);
    Ok(())
}
