//! Command history log.
//!
//! Append-only JSONL, one record per observed request. Only the learner's
//! background worker writes it. Rotation rewrites through a temp file.

use crate::result::{Backend, ErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

pub const HISTORY_FILE: &str = "history.jsonl";

/// Default max entries before rotation
pub const DEFAULT_MAX_ENTRIES: usize = 5000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub input_text: String,
    /// Executed command label, "clarify" when nothing ran
    pub action: String,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    /// Seconds
    pub duration: f64,
    pub backend_used: Option<Backend>,
}

#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
    max_entries: usize,
}

impl HistoryLog {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(HISTORY_FILE),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(4);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record with fsync, rotating when the log grows too large
    pub fn append(&self, record: &HistoryRecord) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let line = serde_json::to_string(record)?;
        writeln!(file, "{}", line)?;
        file.sync_all()?;

        self.maybe_rotate()
    }

    pub fn read_all(&self) -> std::io::Result<Vec<HistoryRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping malformed history line: {}", e),
            }
        }
        Ok(records)
    }

    pub fn erase(&self) -> std::io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn maybe_rotate(&self) -> std::io::Result<()> {
        let records = self.read_all()?;
        if records.len() <= self.max_entries {
            return Ok(());
        }

        // Keep the newest 75%
        let keep_count = self.max_entries * 3 / 4;
        let to_keep = &records[records.len() - keep_count..];

        let temp_path = self.path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&temp_path)?;
            for record in to_keep {
                writeln!(file, "{}", serde_json::to_string(record)?)?;
            }
            file.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}
