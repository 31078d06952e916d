//! Logging and tracing configuration
//!
//! Provides structured logging for both CLI and daemon modes.
//! The daemon logs to a file since it runs in the background.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use super::paths;

/// Initialize tracing for the CLI (stderr logging)
///
/// Logs are controlled by the `RUST_LOG` environment variable.
/// Default level is INFO for this crate, WARN for dependencies.
pub fn init_cli() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fixture=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}

/// Handle keeping the daemon's log writer alive
///
/// Dropping it flushes and stops the background writer thread.
pub struct DaemonLog {
    pub path: Option<PathBuf>,
    _guard: Option<WorkerGuard>,
}

/// Initialize tracing for the daemon (file + stderr logging)
///
/// The daemon logs to both:
/// 1. A log file at `<data dir>/fixture-runner/logs/daemon.log`
/// 2. stderr (inherited from spawning process for early errors)
///
/// Log level controlled by `RUST_LOG`, default is DEBUG for the daemon so
/// channel completions and barrier changes end up in the file.
pub fn init_daemon() -> DaemonLog {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fixture=debug,info"));

    if let Some(log_dir) = paths::log_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let log_file = log_dir.join("daemon.log");

            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
            {
                Ok(file) => {
                    let (writer, guard) = tracing_appender::non_blocking(file);

                    // Channel workers are named threads, keep them in the file
                    let file_layer = fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_names(true)
                        .with_file(true)
                        .with_line_number(true)
                        .with_span_events(FmtSpan::CLOSE);

                    let stderr_layer = fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(true)
                        .with_thread_ids(false)
                        .with_file(false)
                        .compact();

                    tracing_subscriber::registry()
                        .with(filter)
                        .with(file_layer)
                        .with(stderr_layer)
                        .init();

                    return DaemonLog {
                        path: Some(log_file),
                        _guard: Some(guard),
                    };
                }
                Err(e) => {
                    eprintln!("Warning: Could not open log file: {}", e);
                }
            }
        }
    }

    // Fallback: stderr only
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true),
        )
        .init();

    DaemonLog {
        path: None,
        _guard: None,
    }
}

/// Get the path to the daemon log file
pub fn daemon_log_path() -> Option<PathBuf> {
    paths::log_dir().map(|d| d.join("daemon.log"))
}

/// Last `lines` lines of the daemon log
pub fn tail_daemon_log(lines: usize) -> std::io::Result<Vec<String>> {
    let Some(path) = daemon_log_path() else {
        return Ok(Vec::new());
    };
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = std::fs::read_to_string(&path)?;
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|l| l.to_string()).collect())
}

/// Truncate the daemon log file
pub fn truncate_daemon_log() -> std::io::Result<()> {
    if let Some(path) = daemon_log_path() {
        if path.exists() {
            std::fs::write(&path, "")?;
        }
    }
    Ok(())
}
