//! IPC protocol message types
//!
//! Defines the request/response format for CLI ↔ daemon communication.
//! Uses a simple length-prefixed JSON protocol.

use serde::{Deserialize, Serialize};

use crate::common::error::IpcError;

/// IPC request from CLI to daemon
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for matching responses
    pub id: u64,
    /// The command to execute
    pub command: Command,
}

/// IPC response from daemon to CLI
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    /// Request ID this response corresponds to
    pub id: u64,
    /// Whether the command succeeded
    pub success: bool,
    /// Result data on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error information on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<IpcError>,
}

impl Response {
    /// Create a success response
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: u64, error: IpcError) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(error),
        }
    }

    /// Create a success response with no data
    pub fn ok(id: u64) -> Self {
        Self {
            id,
            success: true,
            result: Some(serde_json::json!({})),
            error: None,
        }
    }
}

/// Commands that can be sent from CLI to daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    // === Session ===
    /// Open a session and detect DUTs
    StartSession {
        operator: String,
        batch_number: String,
        #[serde(default)]
        batch_info: String,
    },

    /// Persist records and close the session
    FinishSession,

    // === Methods & functions ===
    /// Methods available for selection
    ListMethods,

    /// Replace the function registry with the one of a method
    SelectMethod { name: String },

    /// Functions of the selected method with their classification
    ListFunctions,

    /// Run one function, or the full cycle when `function` is None
    Run { function: Option<String> },

    // === DUT selection ===
    DutCheck { no: u32, checked: bool },
    DutSelectAll,
    DutReverse,

    // === Daemon ===
    /// Coordinator snapshot
    Status,

    /// Shutdown the daemon
    Shutdown,
}

impl Command {
    /// Commands that never change coordinator state
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            Command::ListMethods | Command::ListFunctions | Command::Status
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let json = serde_json::to_value(Command::Run {
            function: Some("Detect DUTs".to_string()),
        })
        .unwrap();
        assert_eq!(json["type"], "run");
        assert_eq!(json["function"], "Detect DUTs");

        let parsed: Command = serde_json::from_str(
            r#"{"type":"start_session","operator":"Jane","batch_number":"B-17"}"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            Command::StartSession {
                operator: "Jane".to_string(),
                batch_number: "B-17".to_string(),
                batch_info: String::new(),
            }
        );
    }

    #[test]
    fn test_error_response_omits_result() {
        let response = Response::error(
            7,
            IpcError {
                code: "CONTROL_DISABLED".to_string(),
                message: "busy".to_string(),
            },
        );
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], false);
        assert!(json.get("result").is_none());
        assert_eq!(json["error"]["code"], "CONTROL_DISABLED");
    }
}
