//! Typed interpretation of a free-text request.

use crate::error::NixieError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Parameter keys filled in by the recognizer.
pub mod param {
    pub const PACKAGE: &str = "package";
    pub const QUERY: &str = "query";
    pub const GENERATION: &str = "generation";
    pub const SNIPPET: &str = "snippet";
    pub const STORE_PATH: &str = "store_path";
}

/// What the user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentAction {
    /// "install firefox"
    Install,
    /// "remove firefox", "uninstall firefox"
    Remove,
    /// "force remove /nix/store/..." - deletes a store path ignoring liveness
    ForceRemove,
    /// "search for editors"
    Search,
    /// "what is installed"
    ListInstalled,
    /// "update my system"
    Update,
    /// "rebuild"
    Rebuild,
    /// "roll back", "undo the last change"
    Rollback,
    /// "switch to generation 42"
    SwitchGeneration,
    /// "list generations"
    ListGenerations,
    /// "collect garbage"
    CollectGarbage,
    /// "collect all garbage" - also removes old profiles' roots
    CollectGarbageAll,
    /// "remove all old generations"
    PruneGenerations,
    /// "clean up" - expands to garbage collection plus pruning
    CleanUp,
    /// "apply snippet rust-dev"
    ApplySnippet,
    /// "help"
    Help,
    /// Nothing matched well enough
    Unknown,
}

impl IntentAction {
    pub const ALL: [IntentAction; 17] = [
        Self::Install,
        Self::Remove,
        Self::ForceRemove,
        Self::Search,
        Self::ListInstalled,
        Self::Update,
        Self::Rebuild,
        Self::Rollback,
        Self::SwitchGeneration,
        Self::ListGenerations,
        Self::CollectGarbage,
        Self::CollectGarbageAll,
        Self::PruneGenerations,
        Self::CleanUp,
        Self::ApplySnippet,
        Self::Help,
        Self::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Remove => "remove",
            Self::ForceRemove => "force_remove",
            Self::Search => "search",
            Self::ListInstalled => "list_installed",
            Self::Update => "update",
            Self::Rebuild => "rebuild",
            Self::Rollback => "rollback",
            Self::SwitchGeneration => "switch_generation",
            Self::ListGenerations => "list_generations",
            Self::CollectGarbage => "collect_garbage",
            Self::CollectGarbageAll => "collect_garbage_all",
            Self::PruneGenerations => "prune_generations",
            Self::CleanUp => "clean_up",
            Self::ApplySnippet => "apply_snippet",
            Self::Help => "help",
            Self::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for IntentAction {
    type Err = NixieError;

    /// Parse from the snake_case name
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == name)
            .ok_or_else(|| NixieError::MalformedInput(format!("unknown intent action '{}'", s)))
    }
}

impl std::fmt::Display for IntentAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub action: IntentAction,
    pub parameters: BTreeMap<String, String>,
    /// In [0, 1]
    pub confidence: f64,
    pub raw_text: String,
    /// Normalized text after learned aliases were applied, when that changed anything
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewritten: Option<String>,
}

impl Intent {
    pub fn new(action: IntentAction, confidence: f64, raw_text: impl Into<String>) -> Self {
        Self {
            action,
            parameters: BTreeMap::new(),
            confidence: confidence.clamp(0.0, 1.0),
            raw_text: raw_text.into(),
            rewritten: None,
        }
    }

    pub fn unknown(raw_text: impl Into<String>, confidence: f64) -> Self {
        Self::new(IntentAction::Unknown, confidence, raw_text)
    }

    pub fn with_param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn is_unknown(&self) -> bool {
        self.action == IntentAction::Unknown
    }
}
