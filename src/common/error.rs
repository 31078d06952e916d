//! Error types for the fixture runner
//!
//! Messages are written for the operator at the fixture: they say what went
//! wrong and, where there is one, the next thing to try.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the fixture runner
#[derive(Error, Debug)]
pub enum Error {
    // === Daemon/Connection Errors ===
    #[error("Fixture daemon not running. Start a session with 'fixture session start'")]
    DaemonNotRunning,

    #[error("Failed to spawn daemon: timed out waiting for socket after {0} seconds")]
    DaemonSpawnTimeout(u64),

    #[error("Failed to connect to daemon: {0}")]
    DaemonConnectionFailed(#[source] io::Error),

    #[error("Daemon communication error: {0}")]
    DaemonCommunication(String),

    // === Session Errors ===
    #[error("Cannot {action} while the fixture is {state}")]
    InvalidTransition { action: String, state: String },

    #[error("Session information incomplete: {0}")]
    InvalidSessionInfo(String),

    #[error("'{0}' is disabled while another operator action is in progress")]
    ControlDisabled(String),

    // === Channel / Hardware Errors ===
    #[error("Channel {channel} failed to connect: {reason}")]
    Connection { channel: u8, reason: String },

    #[error("Channel {channel} hardware error: {reason}")]
    Hardware { channel: u8, reason: String },

    #[error("Channel {channel} lost contact with its hardware: {reason}")]
    DeviceLost { channel: u8, reason: String },

    #[error("Channel {0} worker has stopped")]
    WorkerStopped(u8),

    #[error("Channel {0} is busy with a previous invocation")]
    ChannelBusy(u8),

    #[error("No channel owns DUT {0}")]
    DutNotFound(u32),

    // === Dispatch Errors ===
    #[error("Test function '{name}' not found in method '{method}'")]
    FunctionNotFound { name: String, method: String },

    #[error("Test method '{0}' not found")]
    MethodNotFound(String),

    #[error("Sequential function '{0}' rejected: the shared fixture resource is in use")]
    SequentialResourceBusy(String),

    #[error("'{function}' failed on channel(s) {channels:?}")]
    ChannelsFailed { function: String, channels: Vec<u8> },

    #[error("Completion barrier is already armed with {0} outstanding invocation(s)")]
    BarrierArmed(usize),

    // === Persistence Errors ===
    #[error("Failed to write DUT records: {0}")]
    Persistence(String),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid state transition error
    pub fn invalid_transition(action: &str, state: impl std::fmt::Display) -> Self {
        Self::InvalidTransition {
            action: action.to_string(),
            state: state.to_string(),
        }
    }

    /// Create a function not found error
    pub fn function_not_found(name: &str, method: &str) -> Self {
        Self::FunctionNotFound {
            name: name.to_string(),
            method: method.to_string(),
        }
    }

    /// Create a per-channel hardware error
    pub fn hardware(channel: u8, reason: impl Into<String>) -> Self {
        Self::Hardware {
            channel,
            reason: reason.into(),
        }
    }

    /// Create a per-channel connection error
    pub fn connection(channel: u8, reason: impl Into<String>) -> Self {
        Self::Connection {
            channel,
            reason: reason.into(),
        }
    }

    /// Whether this error means the channel can no longer reach its hardware
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::DeviceLost { .. } | Self::WorkerStopped(_))
    }
}

/// IPC-serializable error for daemon responses
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IpcError {
    pub code: String,
    pub message: String,
}

impl From<&Error> for IpcError {
    fn from(e: &Error) -> Self {
        let code = match e {
            Error::DaemonNotRunning => "DAEMON_NOT_RUNNING",
            Error::InvalidTransition { .. } => "INVALID_TRANSITION",
            Error::InvalidSessionInfo(_) => "INVALID_SESSION_INFO",
            Error::ControlDisabled(_) => "CONTROL_DISABLED",
            Error::Connection { .. } => "CONNECTION_ERROR",
            Error::DutNotFound(_) => "DUT_NOT_FOUND",
            Error::FunctionNotFound { .. } => "FUNCTION_NOT_FOUND",
            Error::MethodNotFound(_) => "METHOD_NOT_FOUND",
            Error::SequentialResourceBusy(_) => "SEQUENTIAL_RESOURCE_BUSY",
            Error::ChannelsFailed { .. } => "CHANNELS_FAILED",
            Error::BarrierArmed(_) => "BARRIER_ARMED",
            Error::Persistence(_) => "PERSISTENCE_ERROR",
            _ => "INTERNAL_ERROR",
        }
        .to_string();

        Self {
            code,
            message: e.to_string(),
        }
    }
}

impl From<IpcError> for Error {
    fn from(e: IpcError) -> Self {
        // Only errors the CLI reacts to get their own variant back
        match e.code.as_str() {
            "DAEMON_NOT_RUNNING" => Error::DaemonNotRunning,
            "CONTROL_DISABLED" => Error::ControlDisabled(e.message),
            _ => Error::DaemonCommunication(e.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_codes() {
        let e = Error::function_not_found("Test DALI", "OLC Zhaga STD");
        let ipc = IpcError::from(&e);
        assert_eq!(ipc.code, "FUNCTION_NOT_FOUND");
        assert!(ipc.message.contains("Test DALI"));

        let ipc = IpcError::from(&Error::SequentialResourceBusy("Supply power".into()));
        assert_eq!(ipc.code, "SEQUENTIAL_RESOURCE_BUSY");
    }

    #[test]
    fn test_device_lost_classification() {
        assert!(Error::WorkerStopped(2).is_device_lost());
        assert!(Error::DeviceLost {
            channel: 1,
            reason: "port vanished".into()
        }
        .is_device_lost());
        assert!(!Error::hardware(1, "bad response").is_device_lost());
    }
}
