//! Command handler for IPC requests
//!
//! Translates IPC commands into coordinator actions.

use serde_json::json;

use crate::common::{error::IpcError, Result};
use crate::coordinator::{CoordinatorHandle, SessionRequest};
use crate::ipc::protocol::{Command, Response};

/// Handle an IPC command
pub async fn handle_command(handle: &CoordinatorHandle, id: u64, command: Command) -> Response {
    match handle_command_inner(handle, command).await {
        Ok(result) => Response::success(id, result),
        Err(e) => {
            tracing::debug!("Command rejected: {}", e);
            Response::error(id, IpcError::from(&e))
        }
    }
}

async fn handle_command_inner(
    handle: &CoordinatorHandle,
    command: Command,
) -> Result<serde_json::Value> {
    match command {
        Command::StartSession {
            operator,
            batch_number,
            batch_info,
        } => {
            let summary = handle
                .start_new_session(SessionRequest {
                    operator,
                    batch_number,
                    batch_info,
                })
                .await?;
            let status = handle.status();
            Ok(json!({ "session": summary, "duts": status.duts }))
        }

        Command::FinishSession => {
            let summary = handle.finish_session().await?;
            Ok(json!({ "session": summary }))
        }

        Command::ListMethods => {
            let status = handle.status();
            Ok(json!({ "methods": status.methods, "selected": status.method }))
        }

        Command::SelectMethod { name } => {
            let functions = handle.select_method(&name).await?;
            Ok(json!({ "method": name, "functions": functions }))
        }

        Command::ListFunctions => {
            let status = handle.status();
            Ok(json!({ "method": status.method, "functions": status.functions }))
        }

        Command::Run { function: None } => {
            let report = handle.start_full_cycle().await?;
            Ok(serde_json::to_value(report)?)
        }

        Command::Run {
            function: Some(name),
        } => {
            let report = handle.run_function(&name).await?;
            Ok(serde_json::to_value(report)?)
        }

        Command::DutCheck { no, checked } => {
            handle.set_dut_checked(no, checked).await?;
            Ok(json!({ "no": no, "checked": checked }))
        }

        Command::DutSelectAll => {
            handle.select_all().await?;
            Ok(json!({}))
        }

        Command::DutReverse => {
            handle.reverse_selection().await?;
            Ok(json!({}))
        }

        Command::Status => Ok(serde_json::to_value(handle.status())?),

        Command::Shutdown => {
            handle.shutdown().await?;
            Ok(json!({ "status": "stopping" }))
        }
    }
}
