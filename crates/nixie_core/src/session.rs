//! Rolling window of recent requests.
//!
//! In memory only. The learner derives its own aggregates; nothing here is
//! written to disk.

use nixie_shared::intent::IntentAction;
use nixie_shared::result::ErrorKind;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEntry {
    pub text: String,
    pub action: IntentAction,
    /// Target the plan acted on (package, generation, ...), if any
    pub target: Option<String>,
    /// Executed command label; None when nothing ran
    pub command: Option<String>,
    pub success: bool,
    pub error: Option<ErrorKind>,
}

#[derive(Debug, Clone)]
pub struct Session {
    entries: VecDeque<SessionEntry>,
    window: usize,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(10)
    }
}

impl Session {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            entries: VecDeque::with_capacity(window),
            window,
        }
    }

    pub fn record(&mut self, entry: SessionEntry) {
        if self.entries.len() == self.window {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn last(&self) -> Option<&SessionEntry> {
        self.entries.back()
    }

    /// Most recent target, for resolving "it"/"that"
    pub fn last_target(&self) -> Option<&str> {
        self.entries.iter().rev().find_map(|e| e.target.as_deref())
    }

    /// Most recent command that actually ran successfully
    pub fn last_successful_command(&self) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .filter(|e| e.success)
            .find_map(|e| e.command.as_deref())
    }

    pub fn entries(&self) -> impl Iterator<Item = &SessionEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
