//! Learned preferences and their on-disk file.
//!
//! Storage: `<state_dir>/preferences.json` (per-user, never leaves the machine).
//! Writes go to a temp file first and are renamed into place, so an
//! interrupted save leaves the previous file intact.

use crate::request::Verbosity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const PREFERENCES_VERSION: &str = "1.1.0";
pub const PREFERENCES_FILE: &str = "preferences.json";

/// Everything the learner has derived from local observations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnedPreferences {
    /// user word -> canonical word ("grab" -> "install")
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    /// Ordered command pairs seen often enough to suggest
    #[serde(default)]
    pub sequences: Vec<Vec<String>>,
    /// error signature -> commands that resolved it, oldest first
    #[serde(default)]
    pub error_solutions: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub command_frequency: BTreeMap<String, u64>,
    /// Hours of the day (0-23) with any activity
    #[serde(default)]
    pub active_hours: BTreeSet<u8>,
    /// Requests per hour of day
    #[serde(default)]
    pub hour_histogram: BTreeMap<u8, u64>,
}

impl LearnedPreferences {
    pub fn total_commands(&self) -> u64 {
        self.command_frequency.values().sum()
    }

    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_command_count(self.total_commands())
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
            && self.sequences.is_empty()
            && self.error_solutions.is_empty()
            && self.command_frequency.is_empty()
            && self.active_hours.is_empty()
    }

    /// Most used commands, highest count first, ties by name
    pub fn top_commands(&self, n: usize) -> Vec<(&str, u64)> {
        let mut all: Vec<(&str, u64)> = self
            .command_frequency
            .iter()
            .map(|(k, v)| (k.as_str(), *v))
            .collect();
        all.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        all.truncate(n);
        all
    }

    /// "commonly run next" for a command, if a learned pair starts with it
    pub fn next_command(&self, last: &str) -> Option<&str> {
        self.sequences
            .iter()
            .find(|seq| seq.len() >= 2 && seq[0] == last)
            .map(|seq| seq[1].as_str())
    }

    /// Most recent known fix for an error signature
    pub fn solution_for(&self, signature: &str) -> Option<&str> {
        self.error_solutions
            .get(signature)
            .and_then(|s| s.last())
            .map(String::as_str)
    }

    /// "Usually active: 9:00-12:00, 20:00"
    pub fn active_hours_summary(&self) -> String {
        let hours: Vec<u8> = self.active_hours.iter().copied().collect();
        let Some(&first) = hours.first() else {
            return "No usage pattern detected yet".to_string();
        };

        let mut ranges = Vec::new();
        let (mut start, mut end) = (first, first);
        for &hour in &hours[1..] {
            if hour == end + 1 {
                end = hour;
            } else {
                ranges.push((start, end));
                start = hour;
                end = hour;
            }
        }
        ranges.push((start, end));

        let parts: Vec<String> = ranges
            .iter()
            .map(|(s, e)| {
                if s == e {
                    format!("{}:00", s)
                } else {
                    format!("{}:00-{}:00", s, e)
                }
            })
            .collect();
        format!("Usually active: {}", parts.join(", "))
    }
}

/// A (failed_token -> succeeded_token) pair still below the promotion threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasCandidate {
    pub from: String,
    pub to: String,
    pub count: u32,
}

/// An ordered command pair still below the suggestion threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceCandidate {
    pub first: String,
    pub next: String,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidates {
    #[serde(default)]
    pub aliases: Vec<AliasCandidate>,
    #[serde(default)]
    pub sequences: Vec<SequenceCandidate>,
}

/// The preferences file record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferencesFile {
    pub version: String,
    pub last_updated: DateTime<Utc>,
    pub preferences: LearnedPreferences,
    #[serde(default)]
    pub candidates: Candidates,
}

impl PreferencesFile {
    pub fn new(preferences: LearnedPreferences, candidates: Candidates) -> Self {
        Self {
            version: PREFERENCES_VERSION.to_string(),
            last_updated: Utc::now(),
            preferences,
            candidates,
        }
    }
}

/// Single-writer store for the preferences file.
#[derive(Debug, Clone)]
pub struct PreferencesStore {
    path: PathBuf,
}

impl PreferencesStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(PREFERENCES_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the file. Missing file is `Ok(None)`.
    pub fn load(&self) -> std::io::Result<Option<PreferencesFile>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        let file: PreferencesFile = serde_json::from_str(&content)?;
        if file.version != PREFERENCES_VERSION {
            warn!(
                "Preferences file version {} differs from {}, loading anyway",
                file.version, PREFERENCES_VERSION
            );
        }
        Ok(Some(file))
    }

    /// Write via temp file + rename
    pub fn save(&self, file: &PreferencesFile) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        {
            let mut tmp = File::create(&temp_path)?;
            let json = serde_json::to_string_pretty(file)?;
            tmp.write_all(json.as_bytes())?;
            tmp.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    /// Remove the file (and any leftover temp file)
    pub fn erase(&self) -> std::io::Result<()> {
        for path in [self.path.clone(), self.path.with_extension("json.tmp")] {
            match fs::remove_file(&path) {
                Ok(()) => info!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
