//! Functions shared by every test method

use async_trait::async_trait;

use crate::channel::{ChannelContext, ChannelFunction};
use crate::common::Result;
use crate::dispatch::{FixtureContext, FunctionRegistry, SequentialFunction};

/// Verify the channel's probe answers
pub struct TestConnection;

#[async_trait]
impl ChannelFunction for TestConnection {
    async fn run(&self, ctx: &mut ChannelContext) -> Result<()> {
        ctx.probe.establish_connection().await?;
        tracing::info!(
            channel = ctx.ordinal(),
            serial = ctx.probe.serial_number(),
            "Probe connection OK"
        );
        Ok(())
    }
}

/// Find which sockets hold a DUT; clears results of the previous cycle
pub struct DetectDuts;

#[async_trait]
impl ChannelFunction for DetectDuts {
    async fn run(&self, ctx: &mut ChannelContext) -> Result<()> {
        let present = ctx.device.check_devices_present().await?;

        let positions: Vec<u8> = ctx.duts.iter().map(|d| d.position).collect();
        for position in positions {
            if let Some(dut) = ctx.duts.at_mut(position) {
                dut.clear_results();
                dut.available = present.contains(&position);
            }
            ctx.publish_dut(position);
        }

        tracing::info!(
            channel = ctx.ordinal(),
            detected = present.len(),
            "DUT detection finished"
        );
        Ok(())
    }
}

/// Power every selected DUT on, or every available DUT off
pub(crate) async fn switch_power(ctx: &mut ChannelContext, on: bool) -> Result<()> {
    let positions: Vec<u8> = if on {
        ctx.duts.selected_positions()
    } else {
        ctx.duts
            .iter()
            .filter(|d| d.available)
            .map(|d| d.position)
            .collect()
    };

    for position in positions {
        let switched = if on {
            ctx.device.power_on(position).await
        } else {
            ctx.device.power_off(position).await
        };

        match switched {
            Ok(()) => {}
            Err(e) if e.is_device_lost() => return Err(e),
            Err(e) => {
                if let Some(dut) = ctx.duts.at_mut(position) {
                    dut.add_error(e.to_string());
                }
                ctx.publish_dut(position);
            }
        }
    }
    Ok(())
}

/// Shared power rail: channels are switched one after another
pub struct SupplyPower {
    pub on: bool,
}

#[async_trait]
impl SequentialFunction for SupplyPower {
    async fn run(&self, fixture: &mut FixtureContext<'_>) -> Result<()> {
        let on = self.on;
        let function = if on { "power on" } else { "power off" };
        fixture
            .on_each_active(function, move |ctx| Box::pin(switch_power(ctx, on)))
            .await?;
        tracing::info!(on, "DUT power switched");
        Ok(())
    }
}

/// Run a self-test command on each selected DUT and store a pass flag
pub struct QueryCheck {
    pub command: &'static str,
    pub flag: &'static str,
    pub label: &'static str,
}

#[async_trait]
impl ChannelFunction for QueryCheck {
    async fn run(&self, ctx: &mut ChannelContext) -> Result<()> {
        for position in ctx.duts.selected_positions() {
            let response = ctx.device.query(position, self.command).await;
            let (passed, error) = match response {
                Ok(tokens) => {
                    let passed = tokens.last().map(|t| t == "ok").unwrap_or(false);
                    let error = (!passed).then(|| {
                        format!("{} check failed: {}", self.label, tokens.join(" "))
                    });
                    (passed, error)
                }
                Err(e) if e.is_device_lost() => return Err(e),
                Err(e) => (false, Some(e.to_string())),
            };

            let Some(dut) = ctx.duts.at_mut(position) else {
                continue;
            };
            dut.set_property(self.flag, passed);
            match error {
                None => tracing::info!(dut = dut.no, "{} checked", self.label),
                Some(error) => {
                    tracing::warn!(dut = dut.no, "{}", error);
                    dut.add_error(error);
                }
            }
            ctx.publish_dut(position);
        }
        Ok(())
    }
}

/// Read each selected DUT's unique identifier into `id`
pub struct ReadChipId;

#[async_trait]
impl ChannelFunction for ReadChipId {
    async fn run(&self, ctx: &mut ChannelContext) -> Result<()> {
        for position in ctx.duts.selected_positions() {
            let response = ctx.device.query(position, "getChipId").await;
            let id = match response {
                Ok(tokens) => tokens.get(1).cloned(),
                Err(e) if e.is_device_lost() => return Err(e),
                Err(e) => {
                    if let Some(dut) = ctx.duts.at_mut(position) {
                        dut.add_error(e.to_string());
                    }
                    None
                }
            };

            if let Some(dut) = ctx.duts.at_mut(position) {
                match id {
                    Some(id) => {
                        tracing::info!(dut = dut.no, id = %id, "Chip ID read");
                        dut.set_property("id", id);
                    }
                    None => dut.set_property("id", ""),
                }
            }
            ctx.publish_dut(position);
        }
        Ok(())
    }
}

/// Read the supply current of each selected DUT into `csa`
pub struct ReadCsa;

#[async_trait]
impl ChannelFunction for ReadCsa {
    async fn run(&self, ctx: &mut ChannelContext) -> Result<()> {
        for position in ctx.duts.selected_positions() {
            let reading = match ctx.device.query(position, "readCsa").await {
                Ok(tokens) => tokens.get(1).and_then(|t| t.parse::<f64>().ok()),
                Err(e) if e.is_device_lost() => return Err(e),
                Err(e) => {
                    tracing::warn!(channel = ctx.ordinal(), position, "CSA read failed: {}", e);
                    None
                }
            };

            if let (Some(dut), Some(ma)) = (ctx.duts.at_mut(position), reading) {
                dut.set_property("csa", ma);
            }
            ctx.publish_dut(position);
        }
        Ok(())
    }
}

pub fn test_accelerometer() -> QueryCheck {
    QueryCheck {
        command: "testAccel",
        flag: "accelChecked",
        label: "Accelerometer",
    }
}

pub fn test_light_sensor() -> QueryCheck {
    QueryCheck {
        command: "testLight",
        flag: "lightSensChecked",
        label: "Light sensor",
    }
}

pub fn test_dali() -> QueryCheck {
    QueryCheck {
        command: "testDali",
        flag: "daliChecked",
        label: "DALI",
    }
}

pub fn test_gnss() -> QueryCheck {
    QueryCheck {
        command: "testGnss",
        flag: "gnssChecked",
        label: "GNSS",
    }
}

/// Functions every method starts with
pub fn register_common(registry: &mut FunctionRegistry) -> Result<()> {
    registry.parallel("Test connection to JLink", TestConnection)?;
    registry.parallel("Detect DUTs", DetectDuts)?;
    registry.sequential("Supply power to DUTs", SupplyPower { on: true })?;
    registry.sequential("Power off DUTs", SupplyPower { on: false })?;
    registry.parallel("Read CSA", ReadCsa)?;
    Ok(())
}

/// The "Fixture service" method: bring-up and maintenance of the fixture
pub fn service_registry(method: &str) -> Result<FunctionRegistry> {
    let mut registry = FunctionRegistry::new(method);
    register_common(&mut registry)?;
    Ok(registry)
}
