//! Adaptive pattern learner.
//!
//! `LearnerHandle` is the caller side: `observe` never waits, reads come
//! from a snapshot the worker republishes after every change. The worker
//! (see `worker`) owns the state and is the single writer of everything on
//! disk.
//!
//! The learner only produces alias rewrites and suggestions. It never runs
//! anything.

mod state;
mod worker;

pub use state::{AliasState, LearnerState, Observation};

use nixie_shared::config::LearnerConfig;
use nixie_shared::error::{NixieError, Result};
use nixie_shared::history::HistoryLog;
use nixie_shared::preferences::{LearnedPreferences, PreferencesStore};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};
use worker::{LearnerCommand, LearnerWorker};

const TOP_COMMANDS: usize = 5;

#[derive(Clone)]
pub struct LearnerHandle {
    tx: Option<mpsc::UnboundedSender<LearnerCommand>>,
    snapshot: watch::Receiver<Arc<LearnedPreferences>>,
}

impl LearnerHandle {
    /// Start the worker task. Must be called inside a tokio runtime.
    pub fn spawn(config: &LearnerConfig, state_dir: &Path) -> Self {
        if !config.enabled {
            info!("Learning disabled, nothing will be recorded");
            return Self::disabled();
        }
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(LearnedPreferences::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = LearnerWorker::new(config, state_dir, snapshot_tx);
        tokio::spawn(worker.run(rx));
        Self {
            tx: Some(tx),
            snapshot: snapshot_rx,
        }
    }

    /// Records nothing; the snapshot stays empty.
    pub fn disabled() -> Self {
        let (_tx, snapshot) = watch::channel(Arc::new(LearnedPreferences::default()));
        Self { tx: None, snapshot }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue an observation. Returns immediately.
    pub fn observe(&self, observation: Observation) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(LearnerCommand::Observe(Box::new(observation))).is_err() {
            warn!("Learner worker is gone, observation dropped");
        }
    }

    /// Latest published preferences
    pub fn snapshot(&self) -> Arc<LearnedPreferences> {
        self.snapshot.borrow().clone()
    }

    /// Wait until every earlier observation is applied and saved.
    pub async fn flush(&self) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        let (reply, done) = oneshot::channel();
        tx.send(LearnerCommand::Flush(reply))
            .map_err(|_| closed())?;
        done.await.map_err(|_| closed())
    }

    /// Everything learned, as text for the user
    pub async fn export_text(&self) -> Result<String> {
        let Some(tx) = &self.tx else {
            return Ok("Learning is turned off. Nothing about your usage is recorded.".to_string());
        };
        let (reply, text) = oneshot::channel();
        tx.send(LearnerCommand::Export(reply))
            .map_err(|_| closed())?;
        text.await.map_err(|_| closed())
    }

    /// Delete everything learned, on disk and in memory
    pub async fn erase(&self) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        let (reply, result) = oneshot::channel();
        tx.send(LearnerCommand::Erase(reply))
            .map_err(|_| closed())?;
        result.await.map_err(|_| closed())?.map_err(NixieError::from)
    }
}

fn closed() -> NixieError {
    NixieError::LearnerClosed("learner worker stopped".to_string())
}

/// Remove learned data without a running worker (learning disabled, CLI `forget`).
pub fn erase_state_dir(state_dir: &Path) -> std::io::Result<()> {
    PreferencesStore::new(state_dir).erase()?;
    HistoryLog::new(state_dir).erase()
}

/// Human-readable account of everything learned.
pub fn render_export(prefs: &LearnedPreferences, location: &Path) -> String {
    let mut out = vec!["=== What nixie has learned about you ===".to_string(), String::new()];

    if !prefs.aliases.is_empty() {
        out.push("Learned aliases:".to_string());
        for (from, to) in &prefs.aliases {
            out.push(format!("  '{}' -> '{}'", from, to));
        }
        out.push(String::new());
    }

    if !prefs.sequences.is_empty() {
        out.push("Command patterns:".to_string());
        for seq in &prefs.sequences {
            out.push(format!("  {}", seq.join(" -> ")));
        }
        out.push(String::new());
    }

    if !prefs.error_solutions.is_empty() {
        out.push("Fixes that worked:".to_string());
        for (signature, fixes) in &prefs.error_solutions {
            out.push(format!("  {}: {}", signature, fixes.join(", ")));
        }
        out.push(String::new());
    }

    let top = prefs.top_commands(TOP_COMMANDS);
    if !top.is_empty() {
        out.push("Most used commands:".to_string());
        for (command, count) in top {
            out.push(format!("  {}: {} times", command, count));
        }
        out.push(String::new());
    }

    out.push(prefs.active_hours_summary());
    out.push(format!("Verbosity: {}", prefs.verbosity().as_str()));
    out.push(String::new());
    out.push(format!("Total commands tracked: {}", prefs.total_commands()));
    out.push(format!("Data stored at: {}", location.display()));
    out.push("To delete this data, run: nixiectl forget".to_string());
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use nixie_shared::preferences::PREFERENCES_FILE;
    use tempfile::tempdir;

    fn config() -> LearnerConfig {
        LearnerConfig {
            persist_every: 100,
            ..LearnerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_flush_persists_and_reload() {
        let dir = tempdir().unwrap();
        let handle = LearnerHandle::spawn(&config(), dir.path());
        handle.observe(Observation::new(
            "install firefox",
            Some("install firefox".into()),
            true,
            None,
        ));
        handle.flush().await.unwrap();

        assert!(dir.path().join(PREFERENCES_FILE).exists());
        assert_eq!(handle.snapshot().total_commands(), 1);
        let history = HistoryLog::new(dir.path()).read_all().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, "install firefox");

        let again = LearnerHandle::spawn(&config(), dir.path());
        again.flush().await.unwrap();
        assert_eq!(again.snapshot().command_frequency["install firefox"], 1);
    }

    #[tokio::test]
    async fn test_export_and_erase() {
        let dir = tempdir().unwrap();
        let handle = LearnerHandle::spawn(&config(), dir.path());
        handle.observe(
            Observation::new("rebuild", Some("rebuild".into()), true, None).at_hour(9),
        );
        let text = handle.export_text().await.unwrap();
        assert!(text.contains("rebuild: 1 times"));
        assert!(text.contains("Usually active: 9:00"));
        assert!(text.contains(&dir.path().display().to_string()));

        handle.flush().await.unwrap();
        handle.erase().await.unwrap();
        assert!(handle.snapshot().is_empty());
        assert!(!dir.path().join(PREFERENCES_FILE).exists());
        assert!(HistoryLog::new(dir.path()).read_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_periodic_save_without_flush() {
        let dir = tempdir().unwrap();
        let cfg = LearnerConfig {
            persist_every: 1,
            ..LearnerConfig::default()
        };
        let handle = LearnerHandle::spawn(&cfg, dir.path());
        handle.observe(Observation::new("rebuild", Some("rebuild".into()), true, None));

        let path = dir.path().join(PREFERENCES_FILE);
        for _ in 0..200 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(path.exists());
        assert_eq!(HistoryLog::new(dir.path()).read_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_records_nothing() {
        let dir = tempdir().unwrap();
        let handle = LearnerHandle::spawn(
            &LearnerConfig {
                enabled: false,
                ..LearnerConfig::default()
            },
            dir.path(),
        );
        assert!(!handle.is_enabled());
        handle.observe(Observation::new("rebuild", Some("rebuild".into()), true, None));
        handle.flush().await.unwrap();
        assert!(handle.snapshot().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_file_moved_aside() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(PREFERENCES_FILE), "{ not json").unwrap();
        let handle = LearnerHandle::spawn(&config(), dir.path());
        handle.flush().await.unwrap();
        assert!(handle.snapshot().is_empty());
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.contains("corrupt")));
    }
}
