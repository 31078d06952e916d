//! DUT record persistence
//!
//! The coordinator hands the session to the store at each checkpoint. The
//! store writes the session's unsaved records; on failure nothing is marked
//! saved and the same records are offered again at the next checkpoint.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::channel::DutRecord;
use crate::common::{Error, Result};
use crate::coordinator::session::Session;

/// Why records are being written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    /// After provisioning, before the full test
    Midpoint,
    CycleComplete,
    SessionEnd,
    Shutdown,
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Checkpoint::Midpoint => write!(f, "midpoint"),
            Checkpoint::CycleComplete => write!(f, "cycle complete"),
            Checkpoint::SessionEnd => write!(f, "session end"),
            Checkpoint::Shutdown => write!(f, "shutdown"),
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Write the session's unsaved records, all or nothing; returns how many
    async fn write_device_records(&self, session: &Session, checkpoint: Checkpoint) -> Result<usize>;
}

/// One line of the record file
#[derive(Debug, Serialize, Deserialize)]
pub struct StoredRecord {
    pub session_id: String,
    pub operator: String,
    pub batch_number: String,
    pub batch_info: String,
    pub method: String,
    pub cycle: u32,
    pub checkpoint: Checkpoint,
    pub written_at: String,
    pub record: DutRecord,
}

impl StoredRecord {
    fn new(session: &Session, checkpoint: Checkpoint, record: &DutRecord) -> Self {
        Self {
            session_id: session.id.to_string(),
            operator: session.operator.clone(),
            batch_number: session.batch_number.clone(),
            batch_info: session.batch_info.clone(),
            method: session.method.clone(),
            cycle: session.cycles,
            checkpoint,
            written_at: Local::now().to_rfc3339(),
            record: record.clone(),
        }
    }
}

/// Appends records as JSON Lines
pub struct JsonlRecordStore {
    path: PathBuf,
}

impl JsonlRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, lines: &str) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await
    }
}

#[async_trait]
impl RecordStore for JsonlRecordStore {
    async fn write_device_records(&self, session: &Session, checkpoint: Checkpoint) -> Result<usize> {
        let records = session.unsaved_records();
        if records.is_empty() {
            return Ok(0);
        }

        let mut lines = String::new();
        for record in &records {
            lines.push_str(&serde_json::to_string(&StoredRecord::new(session, checkpoint, record))?);
            lines.push('\n');
        }

        self.append(&lines).await.map_err(|e| {
            Error::Persistence(format!("{}: {}", self.path.display(), e))
        })?;

        tracing::debug!(
            path = %self.path.display(),
            count = records.len(),
            %checkpoint,
            "DUT records written"
        );
        Ok(records.len())
    }
}

/// Keeps records in memory; can be told to fail
#[derive(Default)]
pub struct MemoryRecordStore {
    records: tokio::sync::Mutex<Vec<StoredRecord>>,
    failing: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// DUT numbers and checkpoints written so far, in write order
    pub async fn written(&self) -> Vec<(u32, Checkpoint)> {
        self.records
            .lock()
            .await
            .iter()
            .map(|r| (r.record.no, r.checkpoint))
            .collect()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn write_device_records(&self, session: &Session, checkpoint: Checkpoint) -> Result<usize> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Persistence("record store unavailable".to_string()));
        }
        let records = session.unsaved_records();
        let mut stored = self.records.lock().await;
        for record in &records {
            stored.push(StoredRecord::new(session, checkpoint, record));
        }
        Ok(records.len())
    }
}
