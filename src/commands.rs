//! CLI command definitions
//!
//! Defines the clap commands of the fixture CLI.

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Session management
    #[command(subcommand)]
    Session(SessionCommands),

    /// List the available test methods
    Methods,

    /// Select the test method of the running session
    Method {
        /// Method name, e.g. "OLC Zhaga STD"
        name: String,
    },

    /// List the functions of the selected method
    Functions,

    /// Run the full test cycle, or a single function
    Run {
        /// Function to run instead of the full cycle
        #[arg(long, short)]
        function: Option<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// DUT selection
    #[command(subcommand)]
    Dut(DutCommands),

    /// Show coordinator, channel and DUT state
    Status {
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// View daemon log file
    Logs {
        /// Number of lines to show (default: 50)
        #[arg(long, short = 'n', default_value = "50")]
        lines: usize,

        /// Clear the log file
        #[arg(long)]
        clear: bool,
    },

    /// Stop the daemon, releasing every channel
    Stop,

    /// [Internal] Run in daemon mode - spawned automatically
    #[command(hide = true)]
    Daemon,
}

#[derive(Subcommand)]
pub enum SessionCommands {
    /// Start a session: reconnects probes and detects DUTs
    Start {
        /// Operator name
        #[arg(long)]
        operator: String,

        /// Batch number
        #[arg(long)]
        batch: String,

        /// Free-form batch information
        #[arg(long, default_value = "")]
        info: String,
    },

    /// Persist the records and end the session
    Finish,
}

#[derive(Subcommand)]
pub enum DutCommands {
    /// Check (or uncheck) one DUT for testing
    Check {
        /// DUT number
        no: u32,

        /// Uncheck instead
        #[arg(long)]
        off: bool,
    },

    /// Check every DUT
    SelectAll,

    /// Invert the selection of every DUT
    Reverse,
}
