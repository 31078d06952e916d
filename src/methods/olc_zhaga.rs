//! "OLC Zhaga STD": outdoor luminaire controller, Zhaga standard variant

use async_trait::async_trait;

use super::general::{
    register_common, test_accelerometer, test_dali, test_gnss, test_light_sensor, DetectDuts,
    ReadChipId, TestConnection,
};
use crate::channel::{ChannelContext, ChannelFunction, DutOutcome};
use crate::common::Result;
use crate::dispatch::{FixtureContext, FunctionRegistry, SequentialFunction};

/// Accepted raw reading of the 3.3V rail on AIN 1, exclusive bounds
const AIN_VOLTAGE_RANGE: (u32, u32) = (70_000, 72_000);

/// Flags a DUT needs for a pass verdict
const REQUIRED_FLAGS: [&str; 4] = ["voltageChecked", "lightSensChecked", "daliChecked", "accelChecked"];

#[derive(Debug, Clone, Copy)]
pub enum Image {
    Railtest,
    Software,
}

impl Image {
    fn name(self) -> &'static str {
        match self {
            Image::Railtest => "download railtest",
            Image::Software => "download software",
        }
    }

    fn flag(self) -> &'static str {
        match self {
            Image::Railtest => "railtestLoaded",
            Image::Software => "softwareLoaded",
        }
    }
}

/// Program `image` into every selected DUT of the channel, one socket at a time
async fn flash_selected(ctx: &mut ChannelContext, image: Image) -> Result<()> {
    let provisioning = ctx.provisioning().clone();
    let path = match image {
        Image::Railtest => provisioning.railtest_image.clone(),
        Image::Software => provisioning.software_image.clone(),
    };
    let settle = std::time::Duration::from_millis(provisioning.power_settle_ms);

    for position in ctx.duts.selected_positions() {
        let routed = async {
            ctx.device.power_on(position).await?;
            tokio::time::sleep(settle).await;
            ctx.device.switch_swd(position).await
        }
        .await;

        let flashed = match routed {
            Ok(()) => {
                let flashed = async {
                    ctx.probe
                        .connect_target(&provisioning.target_device, provisioning.speed_khz)
                        .await?;
                    ctx.probe.erase().await?;
                    ctx.probe.download(&path, provisioning.flash_address).await?;
                    ctx.probe.reset_and_run().await
                }
                .await;
                if let Err(e) = ctx.probe.close().await {
                    tracing::debug!(channel = ctx.ordinal(), "Probe close after download: {}", e);
                }
                flashed
            }
            Err(e) => Err(e),
        };

        let Some(dut) = ctx.duts.at_mut(position) else {
            continue;
        };
        match flashed {
            Ok(()) => {
                tracing::info!(dut = dut.no, image = %path.display(), "Image downloaded");
                dut.set_property(image.flag(), true);
            }
            Err(e) if e.is_device_lost() => return Err(e),
            Err(e) => {
                tracing::warn!(dut = dut.no, "Download failed: {}", e);
                dut.set_property(image.flag(), false);
                dut.add_error(e.to_string());
            }
        }
        ctx.publish_dut(position);
    }
    Ok(())
}

/// Shared programming mux: channels are flashed one after another
pub struct DownloadImage(pub Image);

#[async_trait]
impl SequentialFunction for DownloadImage {
    async fn run(&self, fixture: &mut FixtureContext<'_>) -> Result<()> {
        let image = self.0;
        fixture
            .on_each_active(image.name(), move |ctx| Box::pin(flash_selected(ctx, image)))
            .await
    }
}

/// Check the 3.3V rail through AIN 1
pub struct CheckAinVoltage;

#[async_trait]
impl ChannelFunction for CheckAinVoltage {
    async fn run(&self, ctx: &mut ChannelContext) -> Result<()> {
        let (low, high) = AIN_VOLTAGE_RANGE;
        for position in ctx.duts.selected_positions() {
            let reading = match ctx.device.query(position, "readAin 1 0").await {
                Ok(tokens) => tokens.get(1).and_then(|t| t.parse::<u32>().ok()),
                Err(e) if e.is_device_lost() => return Err(e),
                Err(e) => {
                    tracing::debug!(channel = ctx.ordinal(), position, "AIN read failed: {}", e);
                    None
                }
            };

            let Some(dut) = ctx.duts.at_mut(position) else {
                continue;
            };
            match reading {
                Some(v) if v > low && v < high => {
                    dut.set_property("voltageChecked", true);
                    tracing::info!(dut = dut.no, "Voltage (3.3V) on AIN 1 checked");
                }
                other => {
                    dut.set_property("voltageChecked", false);
                    let shown = other.map(|v| v.to_string()).unwrap_or_else(|| "none".into());
                    dut.add_error(format!("AIN 1 reading {} outside {}..{}", shown, low, high));
                    tracing::warn!(dut = dut.no, reading = %shown, "Error voltage value on AIN 1");
                }
            }
            ctx.publish_dut(position);
        }
        Ok(())
    }
}

/// Give each selected DUT its verdict and publish it as fully tested
pub struct CheckTestingCompletion;

#[async_trait]
impl ChannelFunction for CheckTestingCompletion {
    async fn run(&self, ctx: &mut ChannelContext) -> Result<()> {
        for position in ctx.duts.selected_positions() {
            let Some(dut) = ctx.duts.at_mut(position) else {
                continue;
            };
            let has_id = dut
                .property("id")
                .and_then(|v| v.as_str())
                .map(|id| !id.is_empty())
                .unwrap_or(false);
            let passed = has_id
                && dut.errors.is_empty()
                && REQUIRED_FLAGS.iter().all(|flag| dut.flag(flag));

            dut.outcome = if passed {
                DutOutcome::Passed
            } else {
                DutOutcome::Failed
            };
            tracing::info!(dut = dut.no, outcome = %dut.outcome, "DUT fully tested");
            ctx.publish_fully_tested(position);
        }
        Ok(())
    }
}

/// The whole per-channel test sequence
///
/// Downloads take the shared fixture resource so channels program one at a
/// time while everything else runs concurrently.
pub struct FullCycle;

#[async_trait]
impl ChannelFunction for FullCycle {
    async fn run(&self, ctx: &mut ChannelContext) -> Result<()> {
        let tested = test_sequence(ctx).await;

        // Every selected DUT gets a verdict, even when the sequence stopped early
        CheckTestingCompletion.run(ctx).await?;
        tested?;

        let mux = ctx.shared_resource();
        let _mux = mux.lock().await;
        flash_selected(ctx, Image::Software).await
    }
}

/// Everything before the verdict; only a lost device ends it early
async fn test_sequence(ctx: &mut ChannelContext) -> Result<()> {
    let result = TestConnection.run(ctx).await;
    absorb(ctx, "connection test", result)?;
    let result = DetectDuts.run(ctx).await;
    absorb(ctx, "DUT detection", result)?;

    {
        let mux = ctx.shared_resource();
        let _mux = mux.lock().await;
        let result = flash_selected(ctx, Image::Railtest).await;
        absorb(ctx, "railtest download", result)?;
    }

    let result = ReadChipId.run(ctx).await;
    absorb(ctx, "chip ID", result)?;
    let result = CheckAinVoltage.run(ctx).await;
    absorb(ctx, "AIN voltage", result)?;
    for check in [test_accelerometer(), test_light_sensor(), test_dali(), test_gnss()] {
        let result = check.run(ctx).await;
        absorb(ctx, check.label, result)?;
    }
    Ok(())
}

/// Turn a failed step into an error on every selected DUT
///
/// A lost device is passed back; there is nothing left to test.
fn absorb(ctx: &mut ChannelContext, step: &str, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_device_lost() => Err(e),
        Err(e) => {
            tracing::warn!(channel = ctx.ordinal(), step, "Step failed: {}", e);
            for position in ctx.duts.selected_positions() {
                if let Some(dut) = ctx.duts.at_mut(position) {
                    dut.add_error(format!("{}: {}", step, e));
                }
                ctx.publish_dut(position);
            }
            Ok(())
        }
    }
}

pub fn registry(method: &str) -> Result<FunctionRegistry> {
    let mut registry = FunctionRegistry::new(method);
    registry.parallel("Full cycle testing", FullCycle)?;
    register_common(&mut registry)?;
    registry.sequential("Download Railtest", DownloadImage(Image::Railtest))?;
    registry.parallel("Read unique device identifiers (ID)", ReadChipId)?;
    registry.parallel("Check voltage on AIN 1 (3.3V)", CheckAinVoltage)?;
    registry.parallel("Test accelerometer", test_accelerometer())?;
    registry.parallel("Test light sensor", test_light_sensor())?;
    registry.parallel("Test DALI", test_dali())?;
    registry.parallel("Test GNSS", test_gnss())?;
    registry.parallel("Check Testing Completion", CheckTestingCompletion)?;
    registry.sequential("Download Software", DownloadImage(Image::Software))?;
    Ok(registry)
}
