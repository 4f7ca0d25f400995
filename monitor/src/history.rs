//! Fall Event History
//!
//! Finalized fall events are appended to a sink. [`JsonlHistory`] keeps
//! them on disk as one JSON object per line.

use crate::{FallEvent, MonitorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

pub const HISTORY_FILE: &str = "fall_events.jsonl";

/// Destination for finalized fall events
pub trait HistorySink: Send + Sync {
    fn append(&self, event: &FallEvent) -> Result<()>;

    /// All stored events, oldest first
    fn load(&self) -> Result<Vec<FallEvent>>;
}

/// In-process history
#[derive(Default)]
pub struct MemoryHistory {
    events: Mutex<Vec<FallEvent>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FallEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl HistorySink for MemoryHistory {
    fn append(&self, event: &FallEvent) -> Result<()> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<FallEvent>> {
        Ok(self.events())
    }
}

/// Append-only JSONL history file
pub struct JsonlHistory {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlHistory {
    /// Open (or create) `fall_events.jsonl` inside `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        create_dir_all(dir).map_err(|e| MonitorError::History(format!("Failed to create directory: {}", e)))?;

        let path = dir.join(HISTORY_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| MonitorError::History(format!("Failed to open {:?}: {}", path, e)))?;

        tracing::debug!("Fall history at {:?}", path);

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write all events as one JSON document, returning the event count
    pub fn export(&self, output_path: &Path) -> Result<usize> {
        let events = self.load()?;
        let count = events.len();

        let export = HistoryExport {
            events,
            exported_at: Utc::now(),
            version: "1.0".to_string(),
        };

        let json = serde_json::to_string_pretty(&export)
            .map_err(|e| MonitorError::History(format!("Serialize error: {}", e)))?;

        std::fs::write(output_path, json).map_err(|e| MonitorError::History(format!("Write error: {}", e)))?;

        tracing::info!("Exported {} fall events to {:?}", count, output_path);
        Ok(count)
    }
}

impl HistorySink for JsonlHistory {
    fn append(&self, event: &FallEvent) -> Result<()> {
        let json =
            serde_json::to_string(event).map_err(|e| MonitorError::History(format!("Serialization error: {}", e)))?;

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{}", json).map_err(|e| MonitorError::History(format!("Write error: {}", e)))?;
        writer.flush().map_err(|e| MonitorError::History(format!("Flush error: {}", e)))?;

        Ok(())
    }

    fn load(&self) -> Result<Vec<FallEvent>> {
        let file = File::open(&self.path).map_err(|e| MonitorError::History(format!("Open error: {}", e)))?;

        let mut events = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| MonitorError::History(format!("Read error: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<FallEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!("Skipping history line {}: {}", number + 1, e),
            }
        }

        Ok(events)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryExport {
    events: Vec<FallEvent>,
    exported_at: DateTime<Utc>,
    version: String,
}
