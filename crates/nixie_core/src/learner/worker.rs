//! Background learner worker.
//!
//! The only writer of the preferences file and the history log. Commands
//! arrive over one queue and are handled strictly in order. Faults are
//! logged and swallowed; nothing here can fail a user request.

use super::render_export;
use super::state::{LearnerState, Observation};
use chrono::Utc;
use nixie_shared::config::LearnerConfig;
use nixie_shared::history::{HistoryLog, HistoryRecord};
use nixie_shared::preferences::{LearnedPreferences, PreferencesStore};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub(crate) enum LearnerCommand {
    Observe(Box<Observation>),
    /// Persist now; replies once every earlier command is handled
    Flush(oneshot::Sender<()>),
    Export(oneshot::Sender<String>),
    Erase(oneshot::Sender<std::io::Result<()>>),
}

pub(crate) struct LearnerWorker {
    state: LearnerState,
    store: PreferencesStore,
    history: HistoryLog,
    persist_every: u32,
    unsaved: u32,
    snapshot: watch::Sender<Arc<LearnedPreferences>>,
}

impl LearnerWorker {
    pub(crate) fn new(
        config: &LearnerConfig,
        state_dir: &Path,
        snapshot: watch::Sender<Arc<LearnedPreferences>>,
    ) -> Self {
        let mut worker = Self {
            state: LearnerState::new(config),
            store: PreferencesStore::new(state_dir),
            history: HistoryLog::new(state_dir).with_max_entries(config.history_max_entries),
            persist_every: config.persist_every.max(1),
            unsaved: 0,
            snapshot,
        };
        worker.load();
        worker
    }

    fn load(&mut self) {
        match self.store.load() {
            Ok(Some(file)) => {
                self.state.restore(file);
                info!(
                    "Loaded learned preferences ({} commands tracked)",
                    self.state.preferences().total_commands()
                );
            }
            Ok(None) => debug!("No learned preferences yet at {}", self.store.path().display()),
            Err(e) if matches!(
                e.kind(),
                std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof
            ) =>
            {
                let aside = self.store.path().with_extension(format!(
                    "json.corrupt-{}",
                    Utc::now().format("%Y%m%d%H%M%S")
                ));
                warn!(
                    "Preferences file is corrupt ({}), moving it to {} and starting fresh",
                    e,
                    aside.display()
                );
                if let Err(e) = std::fs::rename(self.store.path(), &aside) {
                    warn!("Failed to move corrupt preferences aside: {}", e);
                }
            }
            Err(e) => warn!("Failed to load learned preferences: {}", e),
        }
        self.publish();
    }

    fn publish(&self) {
        self.snapshot
            .send_replace(Arc::new(self.state.preferences().clone()));
    }

    async fn save(&mut self) {
        if self.unsaved == 0 {
            return;
        }
        let store = self.store.clone();
        let file = self.state.to_file();
        match on_disk(move || store.save(&file)).await {
            Ok(()) => {
                debug!("Saved learned preferences to {}", self.store.path().display());
                self.unsaved = 0;
            }
            Err(e) => warn!("Failed to save learned preferences: {}", e),
        }
    }

    async fn observe(&mut self, obs: &Observation) {
        let state = self.state.observe(obs);
        debug!(alias_state = ?state, "observed '{}'", obs.input_text);

        let record = HistoryRecord {
            id: Uuid::new_v4(),
            timestamp: obs.at,
            input_text: obs.input_text.clone(),
            action: obs
                .executed_command
                .clone()
                .unwrap_or_else(|| "clarify".to_string()),
            success: obs.success,
            error_kind: obs.error,
            duration: obs.duration,
            backend_used: obs.backend_used,
        };
        let history = self.history.clone();
        if let Err(e) = on_disk(move || history.append(&record)).await {
            warn!("Failed to append history: {}", e);
        }

        self.publish();
        self.unsaved += 1;
        if self.unsaved >= self.persist_every {
            self.save().await;
        }
    }

    async fn erase(&mut self) -> std::io::Result<()> {
        self.state.reset();
        self.unsaved = 0;
        self.publish();
        let store = self.store.clone();
        let history = self.history.clone();
        on_disk(move || {
            store.erase()?;
            history.erase()
        })
        .await?;
        info!("Erased all learned data");
        Ok(())
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<LearnerCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                LearnerCommand::Observe(obs) => self.observe(&obs).await,
                LearnerCommand::Flush(reply) => {
                    self.save().await;
                    let _ = reply.send(());
                }
                LearnerCommand::Export(reply) => {
                    let text = render_export(self.state.preferences(), self.store.path());
                    let _ = reply.send(text);
                }
                LearnerCommand::Erase(reply) => {
                    let _ = reply.send(self.erase().await);
                }
            }
        }
        // all handles dropped
        self.save().await;
        debug!("Learner worker stopped");
    }
}

/// File work runs on the blocking pool, never on the worker task itself.
async fn on_disk<T, F>(work: F) -> std::io::Result<T>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .unwrap_or_else(|e| Err(std::io::Error::other(e)))
}
