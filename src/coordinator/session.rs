//! Session state owned by the coordinator

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::DutRecord;
use crate::common::{Error, Result};

/// Top-level coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    /// No session; waiting for operator and batch
    Idle,
    /// Session open, controls enabled
    SessionActive,
    /// A cycle or single function is running
    Testing,
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorState::Idle => write!(f, "idle"),
            CoordinatorState::SessionActive => write!(f, "session active"),
            CoordinatorState::Testing => write!(f, "testing"),
        }
    }
}

/// Operator input to start a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionRequest {
    pub operator: String,
    pub batch_number: String,
    #[serde(default)]
    pub batch_info: String,
}

impl SessionRequest {
    /// Trimmed copy; operator and batch number are required
    pub fn validated(&self) -> Result<Self> {
        let operator = self.operator.split_whitespace().collect::<Vec<_>>().join(" ");
        let batch_number = self.batch_number.trim().to_string();
        if operator.is_empty() {
            return Err(Error::InvalidSessionInfo("operator name is empty".to_string()));
        }
        if batch_number.is_empty() {
            return Err(Error::InvalidSessionInfo("batch number is empty".to_string()));
        }
        Ok(Self {
            operator,
            batch_number,
            batch_info: self.batch_info.trim().to_string(),
        })
    }
}

/// Session details exposed to test functions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionInfo {
    pub operator: String,
    pub batch_number: String,
    pub batch_info: String,
    pub method: String,
}

pub struct Session {
    pub id: Uuid,
    pub operator: String,
    pub batch_number: String,
    pub batch_info: String,
    pub started_at: DateTime<Local>,
    pub method: String,
    pub cycles: u32,
    /// Authoritative aggregate of published DUT results, by DUT number
    records: BTreeMap<u32, DutRecord>,
    /// DUT numbers whose latest record is not in the store yet
    unsaved: BTreeSet<u32>,
}

impl Session {
    pub fn new(request: SessionRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            operator: request.operator,
            batch_number: request.batch_number,
            batch_info: request.batch_info,
            started_at: Local::now(),
            method: String::new(),
            cycles: 0,
            records: BTreeMap::new(),
            unsaved: BTreeSet::new(),
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            operator: self.operator.clone(),
            batch_number: self.batch_number.clone(),
            batch_info: self.batch_info.clone(),
            method: self.method.clone(),
        }
    }

    /// Take in a DUT's published result
    pub fn record(&mut self, dut: DutRecord) {
        self.unsaved.insert(dut.no);
        self.records.insert(dut.no, dut);
    }

    pub fn records(&self) -> impl Iterator<Item = &DutRecord> {
        self.records.values()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn unsaved_records(&self) -> Vec<&DutRecord> {
        self.unsaved
            .iter()
            .filter_map(|no| self.records.get(no))
            .collect()
    }

    pub fn unsaved_count(&self) -> usize {
        self.unsaved.len()
    }

    /// Mark records as written; records updated since stay unsaved
    pub fn mark_saved(&mut self, written: &[DutRecord]) {
        for dut in written {
            if self.records.get(&dut.no) == Some(dut) {
                self.unsaved.remove(&dut.no);
            }
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.to_string(),
            operator: self.operator.clone(),
            batch_number: self.batch_number.clone(),
            batch_info: self.batch_info.clone(),
            started_at: self.started_at.to_rfc3339(),
            method: self.method.clone(),
            cycles: self.cycles,
            records: self.records.len(),
            passed: self
                .records
                .values()
                .filter(|d| d.outcome == crate::channel::DutOutcome::Passed)
                .count(),
            unsaved: self.unsaved.len(),
        }
    }
}

/// Session overview for status output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub operator: String,
    pub batch_number: String,
    pub batch_info: String,
    pub started_at: String,
    pub method: String,
    pub cycles: u32,
    pub records: usize,
    pub passed: usize,
    pub unsaved: usize,
}
