//! Configuration file handling
//!
//! The fixture is described by a TOML file. A missing file yields a fixture
//! with no channels, which is enough for `status` and the CLI to work.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::paths::config_path;
use super::{Error, Result};

/// Hard upper bound on the number of channel slots in one fixture
pub const MAX_CHANNEL_SLOTS: usize = 5;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Run each channel on its own worker thread
    #[serde(default = "default_multithread")]
    pub multithread: bool,

    /// Maximum number of enabled channels
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,

    /// Channel slots
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    /// Delays and barrier timeout
    #[serde(default)]
    pub timing: TimingConfig,

    /// Which functions make up a full cycle
    #[serde(default)]
    pub cycle: CycleConfig,

    /// Target and image settings for the programming steps
    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    /// DUT record store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Hardware backend selection
    #[serde(default)]
    pub hardware: HardwareConfig,

    /// Behaviour of the simulated backend
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            multithread: default_multithread(),
            max_channels: default_max_channels(),
            channels: Vec::new(),
            timing: TimingConfig::default(),
            cycle: CycleConfig::default(),
            provisioning: ProvisioningConfig::default(),
            store: StoreConfig::default(),
            daemon: DaemonConfig::default(),
            hardware: HardwareConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

fn default_multithread() -> bool {
    true
}
fn default_max_channels() -> usize {
    MAX_CHANNEL_SLOTS
}

/// One channel slot: a probe and the serial port of its DUT carrier
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Slot ordinal, 1-based
    pub ordinal: u8,

    /// Disabled slots are never created
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Serial number of the debug probe
    #[serde(default)]
    pub probe_serial: String,

    /// Serial port of the device client
    #[serde(default)]
    pub port: String,

    /// DUT numbers carried by this channel, in position order
    #[serde(default)]
    pub duts: Vec<u32>,
}

fn default_enabled() -> bool {
    true
}

/// Delays in milliseconds, barrier timeout in seconds
#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    /// Pause between channels when opening or reconnecting probes
    #[serde(default = "default_open_stagger")]
    pub open_stagger_ms: u64,

    /// Pause between per-channel invocations of one dispatch
    #[serde(default = "default_invoke_stagger")]
    pub invoke_stagger_ms: u64,

    /// Settle time after provisioning, before the full test starts
    #[serde(default = "default_provision_settle")]
    pub provision_settle_ms: u64,

    /// Give up on channels that have not reported after this long
    #[serde(default)]
    pub barrier_timeout_secs: Option<u64>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            open_stagger_ms: default_open_stagger(),
            invoke_stagger_ms: default_invoke_stagger(),
            provision_settle_ms: default_provision_settle(),
            barrier_timeout_secs: None,
        }
    }
}

fn default_open_stagger() -> u64 {
    100
}
fn default_invoke_stagger() -> u64 {
    100
}
fn default_provision_settle() -> u64 {
    5000
}

/// Function names used by a full cycle
#[derive(Debug, Clone, Deserialize)]
pub struct CycleConfig {
    /// Method selected when a session starts
    #[serde(default = "default_method")]
    pub default_method: String,

    #[serde(default = "default_detect_function")]
    pub detect_function: String,

    #[serde(default = "default_provision_function")]
    pub provision_function: String,

    #[serde(default = "default_test_function")]
    pub test_function: String,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            default_method: default_method(),
            detect_function: default_detect_function(),
            provision_function: default_provision_function(),
            test_function: default_test_function(),
        }
    }
}

fn default_method() -> String {
    "OLC Zhaga STD".to_string()
}
fn default_detect_function() -> String {
    "Detect DUTs".to_string()
}
fn default_provision_function() -> String {
    "Supply power to DUTs".to_string()
}
fn default_test_function() -> String {
    "Full cycle testing".to_string()
}

/// Probe target and firmware images
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningConfig {
    /// Target device name passed to the probe
    #[serde(default = "default_target_device")]
    pub target_device: String,

    /// SWD clock in kHz
    #[serde(default = "default_speed_khz")]
    pub speed_khz: u32,

    /// Radio test firmware flashed before the functional checks
    #[serde(default = "default_railtest_image")]
    pub railtest_image: PathBuf,

    /// Production firmware flashed at the end of a cycle
    #[serde(default = "default_software_image")]
    pub software_image: PathBuf,

    /// Flash base address for downloads
    #[serde(default)]
    pub flash_address: u32,

    /// Wait after powering a DUT before talking SWD to it
    #[serde(default = "default_power_settle")]
    pub power_settle_ms: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            target_device: default_target_device(),
            speed_khz: default_speed_khz(),
            railtest_image: default_railtest_image(),
            software_image: default_software_image(),
            flash_address: 0,
            power_settle_ms: default_power_settle(),
        }
    }
}

fn default_target_device() -> String {
    "EFR32FG12PXXXF1024".to_string()
}
fn default_speed_khz() -> u32 {
    5000
}
fn default_railtest_image() -> PathBuf {
    PathBuf::from("images/olc_zhaga_railtest.hex")
}
fn default_software_image() -> PathBuf {
    PathBuf::from("images/olc_zhaga_software.hex")
}
fn default_power_settle() -> u64 {
    1000
}

/// DUT record store
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreConfig {
    /// JSON Lines file the records are appended to
    #[serde(default)]
    pub records_path: Option<PathBuf>,
}

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Auto-exit after this many minutes with no active session
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_minutes: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            idle_timeout_minutes: default_idle_timeout(),
        }
    }
}

fn default_idle_timeout() -> u64 {
    30
}

/// Hardware backend used to build channel capabilities
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// In-process stand-ins for the probe and the DUT carrier
    #[default]
    Simulated,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HardwareConfig {
    #[serde(default)]
    pub backend: Backend,
}

/// Simulated hardware behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationConfig {
    /// Latency of every simulated command
    #[serde(default = "default_response_delay")]
    pub response_delay_ms: u64,

    /// Raw ADC value answered to `readAin`
    #[serde(default = "default_ain_reading")]
    pub ain_reading: u32,

    /// Per-channel overrides
    #[serde(default)]
    pub channels: Vec<SimChannelConfig>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            response_delay_ms: default_response_delay(),
            ain_reading: default_ain_reading(),
            channels: Vec::new(),
        }
    }
}

fn default_response_delay() -> u64 {
    20
}
fn default_ain_reading() -> u32 {
    71_000
}

/// Faults injected into one simulated channel
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SimChannelConfig {
    pub ordinal: u8,

    /// The device client refuses to open
    #[serde(default)]
    pub fail_open: bool,

    /// Positions with a DUT in the socket; all positions when absent
    #[serde(default)]
    pub present: Option<Vec<u8>>,

    /// Check commands that report a failure, e.g. `"testDali"`
    #[serde(default)]
    pub failing_checks: Vec<String>,

    /// Device queries never answer
    #[serde(default)]
    pub hang: bool,

    /// Device queries report the port as gone
    #[serde(default)]
    pub lose_device: bool,
}

impl SimulationConfig {
    /// Faults for a given channel, if any were configured
    pub fn channel(&self, ordinal: u8) -> SimChannelConfig {
        self.channels
            .iter()
            .find(|c| c.ordinal == ordinal)
            .cloned()
            .unwrap_or(SimChannelConfig {
                ordinal,
                ..Default::default()
            })
    }
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        match config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load and validate configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check channel count, ordinals and DUT numbering
    pub fn validate(&self) -> Result<()> {
        if self.max_channels == 0 || self.max_channels > MAX_CHANNEL_SLOTS {
            return Err(Error::Config(format!(
                "max_channels must be between 1 and {}, got {}",
                MAX_CHANNEL_SLOTS, self.max_channels
            )));
        }

        let enabled = self.enabled_channels().count();
        if enabled > self.max_channels {
            return Err(Error::Config(format!(
                "{} channels enabled but max_channels is {}",
                enabled, self.max_channels
            )));
        }

        let mut ordinals = HashSet::new();
        let mut duts = HashSet::new();
        for channel in &self.channels {
            if channel.ordinal == 0 || channel.ordinal as usize > MAX_CHANNEL_SLOTS {
                return Err(Error::Config(format!(
                    "channel ordinal {} out of range 1..={}",
                    channel.ordinal, MAX_CHANNEL_SLOTS
                )));
            }
            if !ordinals.insert(channel.ordinal) {
                return Err(Error::Config(format!(
                    "channel {} is configured twice",
                    channel.ordinal
                )));
            }
            if !channel.enabled {
                continue;
            }
            for no in &channel.duts {
                if !duts.insert(*no) {
                    return Err(Error::Config(format!(
                        "DUT {} is assigned to more than one channel",
                        no
                    )));
                }
            }
        }

        Ok(())
    }

    /// Enabled channel slots in ordinal order
    pub fn enabled_channels(&self) -> impl Iterator<Item = &ChannelConfig> {
        let mut channels: Vec<_> = self.channels.iter().filter(|c| c.enabled).collect();
        channels.sort_by_key(|c| c.ordinal);
        channels.into_iter()
    }

    /// Path of the DUT record file
    pub fn records_path(&self) -> Option<PathBuf> {
        self.store
            .records_path
            .clone()
            .or_else(super::paths::records_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = Config::parse("").unwrap();
        assert!(config.multithread);
        assert_eq!(config.max_channels, 5);
        assert!(config.channels.is_empty());
        assert_eq!(config.timing.provision_settle_ms, 5000);
        assert_eq!(config.timing.barrier_timeout_secs, None);
        assert_eq!(config.cycle.provision_function, "Supply power to DUTs");
        assert_eq!(config.hardware.backend, Backend::Simulated);
    }

    #[test]
    fn test_parse_channels() {
        let config = Config::parse(
            r#"
            multithread = false

            [[channels]]
            ordinal = 2
            probe_serial = "000801012345"
            port = "/dev/ttyUSB1"
            duts = [4, 5, 6]

            [[channels]]
            ordinal = 1
            port = "/dev/ttyUSB0"
            duts = [1, 2, 3]

            [[channels]]
            ordinal = 3
            enabled = false
            duts = [1]

            [timing]
            barrier_timeout_secs = 30

            [[simulation.channels]]
            ordinal = 2
            fail_open = true
            "#,
        )
        .unwrap();

        assert!(!config.multithread);
        let ordinals: Vec<u8> = config.enabled_channels().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2]);
        assert_eq!(config.timing.barrier_timeout_secs, Some(30));
        assert!(config.simulation.channel(2).fail_open);
        assert!(!config.simulation.channel(1).fail_open);
    }

    #[test]
    fn test_rejects_duplicate_dut_numbers() {
        let err = Config::parse(
            r#"
            [[channels]]
            ordinal = 1
            duts = [1, 2]

            [[channels]]
            ordinal = 2
            duts = [2, 3]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("DUT 2")));
    }

    #[test]
    fn test_rejects_too_many_channels() {
        let mut text = String::from("max_channels = 2\n");
        for ordinal in 1..=3 {
            text.push_str(&format!("[[channels]]\nordinal = {}\n", ordinal));
        }
        assert!(matches!(Config::parse(&text), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_bad_ordinal() {
        let err = Config::parse("[[channels]]\nordinal = 6\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[[channels]]\nordinal = 1\nduts = [7]\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.channels[0].duts, vec![7]);

        let missing = Config::load_from(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(Error::FileRead { .. })));
    }
}
