//! Fixture runner - multi-channel manufacturing test fixture orchestrator
//!
//! The CLI talks to a background daemon that owns the fixture channels, so a
//! test cycle keeps running between operator commands.

use std::path::PathBuf;

use clap::Parser;
use commands::Commands;
use fixture::common::logging;
use fixture::{cli, commands, daemon};

#[derive(Parser)]
#[command(name = "fixture", about = "Multi-channel test fixture runner")]
#[command(version, long_about = None)]
struct Cli {
    /// Configuration file (default: platform config dir)
    #[arg(long, global = true, env = "FIXTURE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Daemon => {
            let _log = logging::init_daemon();
            daemon::run(cli.config.as_deref()).await
        }
        command => {
            logging::init_cli();
            cli::dispatch(command, cli.config.as_deref()).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
