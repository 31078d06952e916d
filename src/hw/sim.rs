//! Simulated fixture hardware
//!
//! Answers the command vocabulary the built-in methods use, with a fixed
//! latency and faults injected from `[simulation]` in the configuration.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use super::{ChannelHardware, DeviceClient, HardwareProvider, ProbeController};
use crate::common::config::{ChannelConfig, SimChannelConfig, SimulationConfig};
use crate::common::{Error, Result};

/// Builds simulated probes and carriers
pub struct SimulatedProvider {
    config: SimulationConfig,
}

impl SimulatedProvider {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }
}

impl HardwareProvider for SimulatedProvider {
    fn build(&self, channel: &ChannelConfig) -> Result<ChannelHardware> {
        let delay = Duration::from_millis(self.config.response_delay_ms);
        let faults = self.config.channel(channel.ordinal);

        let probe = SimProbe {
            channel: channel.ordinal,
            serial: channel.probe_serial.clone(),
            delay,
            connected: false,
            attached: false,
        };
        let device = SimDevice {
            channel: channel.ordinal,
            port: channel.port.clone(),
            positions: channel.duts.len() as u8,
            ain_reading: self.config.ain_reading,
            faults,
            delay,
            open: false,
            powered: Vec::new(),
        };

        Ok(ChannelHardware {
            probe: Box::new(probe),
            device: Box::new(device),
        })
    }
}

struct SimProbe {
    channel: u8,
    serial: String,
    delay: Duration,
    connected: bool,
    attached: bool,
}

impl SimProbe {
    fn require_attached(&self) -> Result<()> {
        if self.attached {
            Ok(())
        } else {
            Err(Error::hardware(self.channel, "probe is not attached to a target"))
        }
    }
}

#[async_trait]
impl ProbeController for SimProbe {
    fn serial_number(&self) -> &str {
        &self.serial
    }

    async fn establish_connection(&mut self) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.connected = true;
        tracing::debug!(channel = self.channel, serial = %self.serial, "Probe connected");
        Ok(())
    }

    async fn connect_target(&mut self, device: &str, speed_khz: u32) -> Result<()> {
        if !self.connected {
            return Err(Error::hardware(self.channel, "probe connection not established"));
        }
        tokio::time::sleep(self.delay).await;
        tracing::trace!(channel = self.channel, device, speed_khz, "Target attached");
        self.attached = true;
        Ok(())
    }

    async fn erase(&mut self) -> Result<()> {
        self.require_attached()?;
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn download(&mut self, image: &Path, address: u32) -> Result<()> {
        self.require_attached()?;
        tokio::time::sleep(self.delay * 2).await;
        tracing::trace!(channel = self.channel, image = %image.display(), address, "Image written");
        Ok(())
    }

    async fn reset_and_run(&mut self) -> Result<()> {
        self.require_attached()?;
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.attached = false;
        Ok(())
    }
}

struct SimDevice {
    channel: u8,
    port: String,
    positions: u8,
    ain_reading: u32,
    faults: SimChannelConfig,
    delay: Duration,
    open: bool,
    powered: Vec<u8>,
}

impl SimDevice {
    async fn exchange(&mut self) -> Result<()> {
        if !self.open {
            return Err(Error::hardware(self.channel, format!("port {} is not open", self.port)));
        }
        if self.faults.lose_device {
            return Err(Error::DeviceLost {
                channel: self.channel,
                reason: format!("port {} disappeared", self.port),
            });
        }
        if self.faults.hang {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    fn is_present(&self, position: u8) -> bool {
        if position == 0 || position > self.positions {
            return false;
        }
        match &self.faults.present {
            Some(present) => present.contains(&position),
            None => true,
        }
    }

    fn fails(&self, command: &str) -> bool {
        self.faults.failing_checks.iter().any(|c| c == command)
    }
}

#[async_trait]
impl DeviceClient for SimDevice {
    fn port(&self) -> &str {
        &self.port
    }

    async fn open(&mut self) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        if self.faults.fail_open {
            return Err(Error::connection(
                self.channel,
                format!("cannot open serial port {}", self.port),
            ));
        }
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        self.powered.clear();
        Ok(())
    }

    async fn check_devices_present(&mut self) -> Result<Vec<u8>> {
        self.exchange().await?;
        Ok((1..=self.positions).filter(|p| self.is_present(*p)).collect())
    }

    async fn power_on(&mut self, position: u8) -> Result<()> {
        self.exchange().await?;
        if !self.powered.contains(&position) {
            self.powered.push(position);
        }
        Ok(())
    }

    async fn power_off(&mut self, position: u8) -> Result<()> {
        self.exchange().await?;
        self.powered.retain(|p| *p != position);
        Ok(())
    }

    async fn switch_swd(&mut self, position: u8) -> Result<()> {
        self.exchange().await?;
        if !self.is_present(position) {
            return Err(Error::hardware(self.channel, format!("no DUT at position {}", position)));
        }
        Ok(())
    }

    async fn query(&mut self, position: u8, command: &str) -> Result<Vec<String>> {
        self.exchange().await?;
        if !self.is_present(position) {
            return Err(Error::hardware(
                self.channel,
                format!("no answer from position {}", position),
            ));
        }

        let name = command.split_whitespace().next().unwrap_or_default();
        let failing = self.fails(name);
        let response = match name {
            "getChipId" if failing => {
                return Err(Error::hardware(self.channel, "chip ID read timed out"));
            }
            "getChipId" => vec![
                "chipId".to_string(),
                format!("0B57{:02X}{:02X}00C0FFEE", self.channel, position),
            ],
            "readAin" => {
                let reading = if failing {
                    self.ain_reading / 2
                } else {
                    self.ain_reading
                };
                vec!["ain".to_string(), reading.to_string()]
            }
            "readCsa" => vec!["csa".to_string(), "12.4".to_string()],
            "testAccel" | "testLight" | "testDali" | "testGnss" => {
                let verdict = if failing { "fail" } else { "ok" };
                vec![name.to_string(), verdict.to_string()]
            }
            _ => {
                return Err(Error::hardware(
                    self.channel,
                    format!("unknown command '{}'", command),
                ));
            }
        };
        Ok(response)
    }
}
