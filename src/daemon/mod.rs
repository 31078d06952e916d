//! Daemon mode - background process owning the fixture
//!
//! The daemon is spawned automatically by CLI commands. It opens the channels
//! once, runs the coordinator, and serves CLI connections until told to stop.

mod handler;
mod server;

use std::path::Path;
use std::sync::Arc;

use crate::common::{config::Config, Error, Result};
use crate::coordinator::{Coordinator, CoordinatorHandle};
use crate::hw;
use crate::methods::MethodLibrary;
use crate::store::JsonlRecordStore;

/// Run in daemon mode
///
/// Entry point of the hidden `daemon` subcommand:
/// 1. Loads and validates the configuration
/// 2. Builds and opens every enabled channel
/// 3. Starts the coordinator task
/// 4. Serves CLI commands over the local socket
pub async fn run(config_path: Option<&Path>) -> Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "Starting fixture daemon"
    );

    let config = Arc::new(match config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    });

    let records = config
        .records_path()
        .ok_or_else(|| Error::Config("cannot determine the DUT record file location".to_string()))?;
    tracing::info!(
        channels = config.enabled_channels().count(),
        multithread = config.multithread,
        records = %records.display(),
        "Configuration loaded"
    );

    let mut coordinator = Coordinator::new(
        config.clone(),
        hw::provider(&config),
        MethodLibrary::builtin(),
        Arc::new(JsonlRecordStore::new(records)),
    );
    coordinator.open_channels().await;

    let (handle, task) = CoordinatorHandle::spawn(coordinator);
    server::Daemon::new(config, handle, task).run().await
}
