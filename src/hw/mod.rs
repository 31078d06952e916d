//! Hardware capabilities driven by a channel
//!
//! A channel owns one debug probe and one device client. Both are opaque
//! capability objects here; the wire protocols behind them live in the
//! backend that builds them.

pub mod sim;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::common::config::{Backend, ChannelConfig, Config};
use crate::common::Result;

/// Debug probe used to program and control a DUT over SWD
#[async_trait]
pub trait ProbeController: Send {
    /// Serial number the probe is selected by
    fn serial_number(&self) -> &str;

    /// Select the probe on the host and verify it answers
    async fn establish_connection(&mut self) -> Result<()>;

    /// Attach to the target currently routed to the probe
    async fn connect_target(&mut self, device: &str, speed_khz: u32) -> Result<()>;

    async fn erase(&mut self) -> Result<()>;

    /// Write an image to flash at `address`
    async fn download(&mut self, image: &Path, address: u32) -> Result<()>;

    async fn reset_and_run(&mut self) -> Result<()>;

    /// Release the target and the probe
    async fn close(&mut self) -> Result<()>;
}

/// Serial client of the carrier board holding a channel's DUTs
///
/// Positions are 1-based sockets on the carrier.
#[async_trait]
pub trait DeviceClient: Send {
    fn port(&self) -> &str;

    async fn open(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// Positions with a DUT drawing current
    async fn check_devices_present(&mut self) -> Result<Vec<u8>>;

    async fn power_on(&mut self, position: u8) -> Result<()>;

    async fn power_off(&mut self, position: u8) -> Result<()>;

    /// Route the probe's SWD lines to `position`
    async fn switch_swd(&mut self, position: u8) -> Result<()>;

    /// Send a command to the DUT at `position`, returning the response tokens
    async fn query(&mut self, position: u8, command: &str) -> Result<Vec<String>>;
}

/// The hardware a channel owns
pub struct ChannelHardware {
    pub probe: Box<dyn ProbeController>,
    pub device: Box<dyn DeviceClient>,
}

/// Builds hardware for configured channel slots
pub trait HardwareProvider: Send + Sync {
    fn build(&self, channel: &ChannelConfig) -> Result<ChannelHardware>;
}

/// Provider for the backend selected in the configuration
pub fn provider(config: &Config) -> Arc<dyn HardwareProvider> {
    match config.hardware.backend {
        Backend::Simulated => Arc::new(sim::SimulatedProvider::new(config.simulation.clone())),
    }
}
