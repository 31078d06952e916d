//! CLI command handling
//!
//! Dispatches CLI commands to the daemon and formats output.

mod spawn;

use std::path::Path;

use colored::{ColoredString, Colorize};

use crate::channel::{ChannelState, DutOutcome, DutRecord, Outcome};
use crate::commands::{Commands, DutCommands, SessionCommands};
use crate::common::{logging, Error, Result};
use crate::coordinator::{CoordinatorState, CycleReport, SessionSummary, StatusSnapshot, StepReport};
use crate::dispatch::FunctionInfo;
use crate::ipc::protocol::Command;
use crate::ipc::DaemonClient;

/// Dispatch a CLI command
pub async fn dispatch(command: Commands, config: Option<&Path>) -> Result<()> {
    match command {
        Commands::Daemon => Err(Error::Internal(
            "daemon mode is started by the fixture binary itself".to_string(),
        )),

        Commands::Session(SessionCommands::Start {
            operator,
            batch,
            info,
        }) => {
            spawn::ensure_daemon_running(config).await?;
            let mut client = DaemonClient::connect().await?;

            let result = client
                .send_command(Command::StartSession {
                    operator,
                    batch_number: batch,
                    batch_info: info,
                })
                .await?;
            let summary: SessionSummary = serde_json::from_value(result["session"].clone())?;
            let duts: Vec<DutRecord> = serde_json::from_value(result["duts"].clone())?;

            println!(
                "{} Session started for {} (batch {})",
                "✓".green(),
                summary.operator.bold(),
                summary.batch_number.bold()
            );
            println!("  Method: {}", summary.method);
            print_duts(&duts);
            Ok(())
        }

        Commands::Session(SessionCommands::Finish) => {
            let mut client = DaemonClient::connect().await?;
            let result = client.send_command(Command::FinishSession).await?;
            let summary: Option<SessionSummary> = serde_json::from_value(result["session"].clone())?;

            match summary {
                Some(summary) => {
                    println!("{} Session finished", "✓".green());
                    println!(
                        "  {} cycle(s), {} DUT record(s), {} passed",
                        summary.cycles, summary.records, summary.passed
                    );
                    if summary.unsaved > 0 {
                        println!(
                            "  {} {} record(s) could not be persisted, see 'fixture logs'",
                            "!".yellow(),
                            summary.unsaved
                        );
                    }
                }
                None => println!("No session to finish"),
            }
            Ok(())
        }

        Commands::Methods => {
            let mut client = DaemonClient::connect().await?;
            let result = client.send_command(Command::ListMethods).await?;
            let methods: Vec<String> = serde_json::from_value(result["methods"].clone())?;
            let selected = result["selected"].as_str();

            for method in &methods {
                if Some(method.as_str()) == selected {
                    println!("{} {}", "*".green(), method.bold());
                } else {
                    println!("  {}", method);
                }
            }
            Ok(())
        }

        Commands::Method { name } => {
            let mut client = DaemonClient::connect().await?;
            let result = client.send_command(Command::SelectMethod { name: name.clone() }).await?;
            let functions: Vec<FunctionInfo> = serde_json::from_value(result["functions"].clone())?;

            println!("Method selected: {}", name.bold());
            print_functions(&functions);
            Ok(())
        }

        Commands::Functions => {
            let mut client = DaemonClient::connect().await?;
            let result = client.send_command(Command::ListFunctions).await?;
            let functions: Vec<FunctionInfo> = serde_json::from_value(result["functions"].clone())?;

            match result["method"].as_str() {
                Some(method) => println!("Method: {}", method.bold()),
                None => println!("No method selected (start a session first)"),
            }
            print_functions(&functions);
            Ok(())
        }

        Commands::Run { function, json } => {
            let mut client = DaemonClient::connect().await?;
            let full_cycle = function.is_none();
            let result = client.send_command(Command::Run { function }).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else if full_cycle {
                let report: CycleReport = serde_json::from_value(result)?;
                print_cycle(&report);
            } else {
                let report: StepReport = serde_json::from_value(result)?;
                print_step(&report);
            }
            Ok(())
        }

        Commands::Dut(dut_cmd) => {
            let mut client = DaemonClient::connect().await?;
            match dut_cmd {
                DutCommands::Check { no, off } => {
                    client
                        .send_command(Command::DutCheck { no, checked: !off })
                        .await?;
                    println!("DUT {} {}", no, if off { "unchecked" } else { "checked" });
                }
                DutCommands::SelectAll => {
                    client.send_command(Command::DutSelectAll).await?;
                    println!("All DUTs checked");
                }
                DutCommands::Reverse => {
                    client.send_command(Command::DutReverse).await?;
                    println!("DUT selection reversed");
                }
            }
            Ok(())
        }

        Commands::Status { json } => {
            match DaemonClient::connect().await {
                Ok(mut client) => {
                    let result = client.send_command(Command::Status).await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&result)?);
                    } else {
                        let status: StatusSnapshot = serde_json::from_value(result)?;
                        println!("Daemon: {}", "running".green());
                        print_status(&status);
                    }
                }
                Err(Error::DaemonNotRunning) => {
                    println!("Daemon: {}", "not running".dimmed());
                    println!("Session: none");
                }
                Err(e) => return Err(e),
            }
            Ok(())
        }

        Commands::Logs { lines, clear } => {
            if clear {
                logging::truncate_daemon_log()?;
                println!("Daemon log cleared");
                return Ok(());
            }

            match logging::daemon_log_path() {
                Some(path) if path.exists() => {
                    for line in logging::tail_daemon_log(lines)? {
                        println!("{}", line);
                    }
                }
                Some(path) => println!("No daemon log yet ({})", path.display()),
                None => println!("Cannot determine the daemon log location"),
            }
            Ok(())
        }

        Commands::Stop => {
            match DaemonClient::connect().await {
                Ok(mut client) => {
                    client.send_command(Command::Shutdown).await?;
                    println!("Daemon stopped");
                }
                Err(Error::DaemonNotRunning) => println!("Daemon is not running"),
                Err(e) => return Err(e),
            }
            Ok(())
        }
    }
}

fn print_status(status: &StatusSnapshot) {
    let state = match status.state {
        CoordinatorState::Idle => status.state.to_string().dimmed(),
        CoordinatorState::SessionActive => status.state.to_string().green(),
        CoordinatorState::Testing => status.state.to_string().yellow(),
    };
    println!("State: {}{}", state, if status.busy { " (busy)" } else { "" });
    println!(
        "Mode: {}",
        if status.multithread {
            "one worker per channel"
        } else {
            "single thread"
        }
    );

    if status.barrier_armed {
        println!(
            "Barrier: {} ({} outstanding)",
            "armed".yellow(),
            status.outstanding
        );
    } else {
        println!("Barrier: disarmed");
    }

    match &status.session {
        Some(session) => {
            println!(
                "Session: {} / batch {}{}",
                session.operator.bold(),
                session.batch_number.bold(),
                if session.batch_info.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", session.batch_info)
                }
            );
            println!("  Method: {}", session.method);
            println!(
                "  Cycles: {}, records: {}, passed: {}, unsaved: {}",
                session.cycles, session.records, session.passed, session.unsaved
            );
        }
        None => println!("Session: none"),
    }

    let enabled: Vec<String> = status
        .controls
        .iter()
        .filter(|(_, enabled)| *enabled)
        .map(|(control, _)| control.to_string())
        .collect();
    println!(
        "Controls: {}",
        if enabled.is_empty() {
            "none".dimmed().to_string()
        } else {
            enabled.join(", ")
        }
    );

    println!("\nChannels:");
    if status.channels.is_empty() {
        println!("  none configured");
    }
    for channel in &status.channels {
        println!(
            "  {}  {}  port {}  probe {}  DUTs {:?}",
            channel.ordinal,
            channel_state(channel.state),
            channel.port,
            if channel.probe_serial.is_empty() {
                "-"
            } else {
                channel.probe_serial.as_str()
            },
            channel.duts
        );
    }

    if !status.duts.is_empty() {
        println!();
        print_duts(&status.duts);
    }
}

fn channel_state(state: ChannelState) -> ColoredString {
    let text = format!("{:<12}", state.to_string());
    match state {
        ChannelState::Active => text.green(),
        ChannelState::Busy | ChannelState::Connecting => text.yellow(),
        ChannelState::Disconnected => text.red(),
        ChannelState::Idle => text.dimmed(),
    }
}

fn print_duts(duts: &[DutRecord]) {
    println!("DUTs:");
    for dut in duts {
        let outcome = match dut.outcome {
            DutOutcome::Passed => "passed".green(),
            DutOutcome::Failed => "failed".red(),
            DutOutcome::Untested => "untested".dimmed(),
        };
        println!(
            "  [{}] {:>4}  ch{} pos{}  {:<9} {}",
            if dut.checked { "x" } else { " " },
            dut.no,
            dut.channel,
            dut.position,
            if dut.available { "present" } else { "absent" },
            outcome
        );
        if let Some(id) = dut.property("id").and_then(|v| v.as_str()) {
            println!("          id {}", id.dimmed());
        }
        for error in &dut.errors {
            println!("          {} {}", "✗".red(), error);
        }
    }
}

fn print_functions(functions: &[FunctionInfo]) {
    for function in functions {
        println!("  {:<40} {}", function.name, function.classification.to_string().dimmed());
    }
}

fn outcome(outcome: &Outcome) -> ColoredString {
    match outcome {
        Outcome::Passed => "passed".green(),
        Outcome::Failed(reason) => format!("failed: {}", reason).red(),
        Outcome::Lost(reason) => format!("lost: {}", reason).red().bold(),
        Outcome::TimedOut => "timed out".red().bold(),
    }
}

fn print_step(report: &StepReport) {
    let dispatch = &report.dispatch;
    println!(
        "{} {} ({}, {} ms)",
        "▶".cyan(),
        dispatch.function.bold(),
        dispatch.classification,
        dispatch.elapsed_ms
    );
    if let Some(result) = &dispatch.outcome {
        println!("  fixture: {}", outcome(result));
    }
    if dispatch.outcome.is_none() && dispatch.addressed.is_empty() {
        println!("  {}", "no active channel".yellow());
    }
    for completion in &report.completions {
        println!(
            "  channel {}: {} ({} ms)",
            completion.channel,
            outcome(&completion.outcome),
            completion.elapsed_ms
        );
    }
}

fn print_cycle(report: &CycleReport) {
    for step in &report.steps {
        print_step(step);
    }
    println!(
        "\n{} Cycle {} finished: {} DUT record(s), {} passed",
        "✓".green().bold(),
        report.cycle,
        report.records,
        report.passed
    );
    if report.unsaved > 0 {
        println!(
            "  {} {} record(s) not persisted yet",
            "!".yellow(),
            report.unsaved
        );
    }
}
