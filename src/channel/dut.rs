//! Device-under-test records and per-channel selection state

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::{Error, Result};

/// Verdict of the last completed test of a DUT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DutOutcome {
    #[default]
    Untested,
    Passed,
    Failed,
}

impl std::fmt::Display for DutOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DutOutcome::Untested => write!(f, "untested"),
            DutOutcome::Passed => write!(f, "passed"),
            DutOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// One DUT socket on a channel's carrier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DutRecord {
    /// Fixture-wide DUT number
    pub no: u32,
    /// Owning channel
    pub channel: u8,
    /// 1-based socket position on the carrier
    pub position: u8,
    /// A device was detected in the socket
    pub available: bool,
    /// Selected by the operator for testing
    pub checked: bool,
    pub outcome: DutOutcome,
    /// Free-form results keyed by check name
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl DutRecord {
    pub fn new(channel: u8, position: u8, no: u32) -> Self {
        Self {
            no,
            channel,
            position,
            available: false,
            checked: true,
            outcome: DutOutcome::Untested,
            data: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    /// Detected and checked
    pub fn is_selected(&self) -> bool {
        self.available && self.checked
    }

    pub fn set_property(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.data.insert(key.to_string(), value.into());
    }

    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// A boolean result flag; absent counts as not passed
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.data.get(key), Some(serde_json::Value::Bool(true)))
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Forget the results of a previous cycle
    pub fn clear_results(&mut self) {
        self.outcome = DutOutcome::Untested;
        self.data.clear();
        self.errors.clear();
    }
}

/// The DUT sockets owned by one channel
#[derive(Debug, Clone)]
pub struct DutBank {
    duts: Vec<DutRecord>,
}

impl DutBank {
    /// Sockets numbered by position, carrying the given DUT numbers
    pub fn new(channel: u8, numbers: &[u32]) -> Self {
        let duts = numbers
            .iter()
            .enumerate()
            .map(|(i, no)| DutRecord::new(channel, (i + 1) as u8, *no))
            .collect();
        Self { duts }
    }

    pub fn len(&self) -> usize {
        self.duts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.duts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DutRecord> {
        self.duts.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DutRecord> {
        self.duts.iter_mut()
    }

    pub fn at(&self, position: u8) -> Option<&DutRecord> {
        self.duts.iter().find(|d| d.position == position)
    }

    pub fn at_mut(&mut self, position: u8) -> Option<&mut DutRecord> {
        self.duts.iter_mut().find(|d| d.position == position)
    }

    pub fn contains(&self, no: u32) -> bool {
        self.duts.iter().any(|d| d.no == no)
    }

    /// Positions of available, checked DUTs
    pub fn selected_positions(&self) -> Vec<u8> {
        self.duts
            .iter()
            .filter(|d| d.is_selected())
            .map(|d| d.position)
            .collect()
    }

    /// Check or uncheck one DUT, returning its updated record
    pub fn set_checked(&mut self, no: u32, checked: bool) -> Result<DutRecord> {
        let dut = self
            .duts
            .iter_mut()
            .find(|d| d.no == no)
            .ok_or(Error::DutNotFound(no))?;
        dut.checked = checked;
        Ok(dut.clone())
    }

    /// Check every DUT, returning the records that changed
    pub fn select_all(&mut self) -> Vec<DutRecord> {
        self.duts
            .iter_mut()
            .filter(|d| !d.checked)
            .map(|d| {
                d.checked = true;
                d.clone()
            })
            .collect()
    }

    /// Invert the checked flag of every DUT
    pub fn reverse_selection(&mut self) -> Vec<DutRecord> {
        self.duts
            .iter_mut()
            .map(|d| {
                d.checked = !d.checked;
                d.clone()
            })
            .collect()
    }

    /// Back to the state of a freshly built bank
    pub fn reset(&mut self) -> Vec<DutRecord> {
        self.duts
            .iter_mut()
            .map(|d| {
                d.available = false;
                d.checked = true;
                d.clear_results();
                d.clone()
            })
            .collect()
    }
}
