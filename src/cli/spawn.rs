//! Daemon spawning logic
//!
//! Automatically spawns the daemon process when needed, using the same binary
//! with the hidden `daemon` subcommand.

use std::path::Path;
use std::time::Duration;

use crate::common::{paths, Error, Result};
use crate::ipc::{transport, DaemonClient};

/// Timeout for daemon to start up; opening channels takes a moment
const SPAWN_TIMEOUT_SECS: u64 = 10;

/// Ensure the daemon is running, spawning it if necessary
pub async fn ensure_daemon_running(config: Option<&Path>) -> Result<()> {
    match DaemonClient::connect().await {
        Ok(mut client) => {
            if client.ping().await? {
                return Ok(());
            }
            spawn_daemon(config).await
        }
        Err(Error::DaemonNotRunning) => spawn_daemon(config).await,
        Err(e) => Err(e),
    }
}

fn daemon_command(exe: &Path, config: Option<&Path>) -> std::process::Command {
    let mut command = std::process::Command::new(exe);
    command.arg("daemon");
    if let Some(path) = config {
        command.arg("--config").arg(path);
    }
    command
}

async fn spawn_daemon(config: Option<&Path>) -> Result<()> {
    tracing::debug!("Spawning daemon process");

    let exe_path = std::env::current_exe()
        .map_err(|e| Error::Internal(format!("Failed to get current executable path: {}", e)))?;

    // A relative config path must survive the daemon's detached start
    let config = config.map(|p| p.canonicalize().unwrap_or_else(|_| p.to_path_buf()));

    paths::ensure_socket_dir()?;
    paths::remove_socket()?;

    // Output goes nowhere; the daemon writes its own log file
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        use std::process::Stdio;

        daemon_command(&exe_path, config.as_deref())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| Error::Internal(format!("Failed to spawn daemon: {}", e)))?;
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        use std::process::Stdio;
        const DETACHED_PROCESS: u32 = 0x00000008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;

        daemon_command(&exe_path, config.as_deref())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP)
            .spawn()
            .map_err(|e| Error::Internal(format!("Failed to spawn daemon: {}", e)))?;
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(SPAWN_TIMEOUT_SECS);
    loop {
        if std::time::Instant::now() >= deadline {
            return Err(Error::DaemonSpawnTimeout(SPAWN_TIMEOUT_SECS));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        if !transport::socket_exists() {
            continue;
        }
        if transport::connect().await.is_ok() {
            tracing::debug!("Daemon started successfully");
            return Ok(());
        }
    }
}
