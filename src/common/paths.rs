//! Cross-platform socket, configuration and data paths
//!
//! Unix/macOS: Unix domain socket at $XDG_RUNTIME_DIR or /tmp
//! Windows: named pipe `fixture-runner-<username>`

use std::io;
use std::path::PathBuf;

/// Application name used for the socket and the project directories
const APP_NAME: &str = "fixture-runner";

/// Environment variable overriding the configuration file location
pub const CONFIG_ENV: &str = "FIXTURE_CONFIG";

/// Get the socket/pipe path for IPC communication
#[cfg(unix)]
pub fn socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(APP_NAME).join("daemon.sock");
    }

    // Fallback to /tmp with uid so two operators on one host don't collide
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/{}-{}", APP_NAME, uid)).join("daemon.sock")
}

#[cfg(windows)]
pub fn socket_path() -> PathBuf {
    PathBuf::from(socket_name())
}

/// Socket name in the form the interprocess crate expects
#[cfg(unix)]
pub fn socket_name() -> String {
    socket_path().to_string_lossy().into_owned()
}

#[cfg(windows)]
pub fn socket_name() -> String {
    let username = std::env::var("USERNAME").unwrap_or_else(|_| "default".to_string());
    format!("{}-{}", APP_NAME, username)
}

/// Ensure the socket directory exists (mode 0700 on Unix)
#[cfg(unix)]
pub fn ensure_socket_dir() -> io::Result<PathBuf> {
    let socket = socket_path();
    let dir = socket
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Invalid socket path"))?;

    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(dir.to_path_buf())
}

#[cfg(windows)]
pub fn ensure_socket_dir() -> io::Result<PathBuf> {
    Ok(PathBuf::new())
}

/// Remove a stale socket file
#[cfg(unix)]
pub fn remove_socket() -> io::Result<()> {
    let path = socket_path();
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    Ok(())
}

#[cfg(windows)]
pub fn remove_socket() -> io::Result<()> {
    Ok(())
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", APP_NAME)
}

/// Get the configuration directory path
///
/// - Linux: `~/.config/fixture-runner/`
/// - macOS: `~/Library/Application Support/fixture-runner/`
/// - Windows: `%APPDATA%\fixture-runner\`
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
///
/// `FIXTURE_CONFIG` wins over the platform location.
pub fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Get the path to the log directory
pub fn log_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().join("logs"))
}

/// Default location of the DUT record file
pub fn records_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().join("records").join("dut-records.jsonl"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_is_valid() {
        let path = socket_path();
        assert!(!path.as_os_str().is_empty());
    }

    #[test]
    fn test_records_path_is_jsonl() {
        if let Some(path) = records_path() {
            assert_eq!(path.extension().and_then(|e| e.to_str()), Some("jsonl"));
        }
    }
}
