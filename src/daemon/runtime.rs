//! # Daemon Runtime
//!
//! What every daemon binary shares: the command-line surface, tracing
//! subscriber composition, the JSON settings file, and the pid-file
//! already-running check.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, Layer};

use crate::error::{Error, Result};
use crate::logging::{level_filter, DaemonLogFormatter};

/// Command-line options common to every daemon.
#[derive(Parser, Debug, Clone)]
#[command(version)]
pub struct DaemonOpts {
    /// Run in the foreground instead of daemonizing.
    #[arg(short = 'f', long = "foreground")]
    pub foreground: bool,

    /// Path to the JSON setting file.
    #[arg(short = 's', long = "setting-file")]
    pub setting_file: Option<PathBuf>,

    /// Trace level: 0 off, 1 error, 2 warn, 3 info, 4 debug, 5 trace.
    #[arg(short = 'T', long = "trace-level", default_value_t = 3)]
    pub trace_level: u8,

    /// Write detailed logs to this file.
    #[arg(short = 'F', long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Mirror logs to stdout, colorized by level.
    #[arg(short = 'O', long = "log-stdout")]
    pub log_stdout: bool,

    /// Cap on the log file size, in bytes.
    #[arg(short = 'S', long = "log-file-size")]
    pub log_file_size: Option<u64>,
}

/// Settings shared by the daemons' setting files; unknown fields are
/// ignored so files can carry daemon-specific sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Override of the daemon's listening socket path.
    pub socket_path: Option<String>,
    /// Override of the connection pool size.
    pub max_conns: Option<usize>,
    /// Override of per-connection buffer sizes.
    pub buffer_size: Option<usize>,
    /// Override of the dispatcher queue cap.
    pub max_queued_msgs: Option<u32>,
}

/// Load the daemon settings from a JSON file.
pub fn load_settings(path: &Path) -> Result<DaemonSettings> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|_| Error::InvalidData)
}

/// Compose the tracing subscriber from the daemon options. `program` tags
/// every stdout line.
///
/// Returns the appender guard that must stay alive for the life of the
/// process when file logging is enabled.
pub fn init_logging(opts: &DaemonOpts, program: &str) -> Option<WorkerGuard> {
    let level = level_filter(opts.trace_level);

    let (file_layer, guard) = match opts.log_file.as_deref() {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file = path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("daemon.log"));
            let appender = tracing_appender::rolling::daily(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(level)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stdout_layer = if opts.log_stdout {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(DaemonLogFormatter::new(program))
                .with_filter(level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .init();

    if let Some(cap) = opts.log_file_size {
        // The appender rotates daily; the byte cap is advisory.
        info!("log file size cap: {} bytes", cap);
    }
    guard
}

/// Conventional pid-file path for a daemon.
pub fn pid_file_path(program: &str) -> PathBuf {
    PathBuf::from(format!("/var/run/{}.pid", program))
}

/// Refuse to start when the pid file points at a live process whose
/// `/proc/<pid>/status` Name matches `program`.
///
/// A missing or stale pid file is not an error; the caller overwrites it
/// with [`write_pid_file`].
pub fn check_already_running(pid_file: &Path, program: &str) -> Result<()> {
    let raw = match std::fs::read_to_string(pid_file) {
        Ok(raw) => raw,
        Err(_) => return Ok(()),
    };
    let pid: u32 = match raw.trim().parse() {
        Ok(pid) => pid,
        Err(_) => return Ok(()),
    };
    let status = match std::fs::read_to_string(format!("/proc/{}/status", pid)) {
        Ok(status) => status,
        Err(_) => return Ok(()),
    };
    let name = status
        .lines()
        .find_map(|line| line.strip_prefix("Name:"))
        .map(str::trim);
    if name == Some(program) {
        return Err(Error::AlreadyRunning(pid));
    }
    Ok(())
}

/// Record this process in the pid file: the decimal pid and a newline.
pub fn write_pid_file(pid_file: &Path) -> Result<()> {
    std::fs::write(pid_file, format!("{}\n", std::process::id()))?;
    Ok(())
}

/// Remove the pid file on clean shutdown.
pub fn remove_pid_file(pid_file: &Path) {
    let _ = std::fs::remove_file(pid_file);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn own_program_name() -> String {
        std::fs::read_to_string("/proc/self/status")
            .unwrap()
            .lines()
            .find_map(|line| line.strip_prefix("Name:"))
            .map(|name| name.trim().to_string())
            .unwrap()
    }

    /// A pid file naming a live process with our own program name blocks
    /// startup; any other name does not.
    #[test]
    fn test_pid_file_detects_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("daemon.pid");
        write_pid_file(&pid_file).unwrap();

        let name = own_program_name();
        assert!(matches!(
            check_already_running(&pid_file, &name),
            Err(Error::AlreadyRunning(_))
        ));
        assert!(check_already_running(&pid_file, "definitely-not-us").is_ok());
    }

    #[test]
    fn test_missing_or_garbage_pid_file_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("absent.pid");
        assert!(check_already_running(&pid_file, "anything").is_ok());

        std::fs::write(&pid_file, "not a pid\n").unwrap();
        assert!(check_already_running(&pid_file, "anything").is_ok());
    }

    #[test]
    fn test_pid_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("self.pid");
        write_pid_file(&pid_file).unwrap();
        let raw = std::fs::read_to_string(&pid_file).unwrap();
        assert_eq!(raw, format!("{}\n", std::process::id()));
    }

    #[test]
    fn test_settings_parse_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"max_conns": 5, "unknown_field": true}"#).unwrap();
        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.max_conns, Some(5));
        assert!(settings.socket_path.is_none());
    }
}
