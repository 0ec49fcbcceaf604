//! Actions and plans.
//!
//! Safety classification and dry-run capability are static per operation.
//! The planner never decides them ad hoc; it only picks operations.

use crate::error::NixieError;
use serde::{Deserialize, Serialize};

// =============================================================================
// Safety
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Safety {
    Safe,
    ConfirmRequired,
    Destructive,
}

impl Safety {
    pub fn needs_confirmation(&self) -> bool {
        !matches!(self, Safety::Safe)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Safety::Safe => "safe",
            Safety::ConfirmRequired => "confirm-required",
            Safety::Destructive => "destructive",
        }
    }
}

impl std::fmt::Display for Safety {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Operations
// =============================================================================

/// One concrete system operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Install,
    Remove,
    ForceRemove,
    Search,
    ListInstalled,
    Update,
    Rebuild,
    Rollback,
    SwitchGeneration,
    ListGenerations,
    CollectGarbage,
    CollectGarbageAll,
    PruneGenerations,
    ApplySnippet,
    Help,
    /// Synthetic no-op asking the user to rephrase
    Clarify,
}

/// Operations that can never be undone, not even through a generation switch.
const IRREVERSIBLE: &[Operation] = &[
    Operation::ForceRemove,
    Operation::CollectGarbageAll,
    Operation::PruneGenerations,
];

/// Operations that touch persistent system state.
const STATE_MODIFYING: &[Operation] = &[
    Operation::Install,
    Operation::Remove,
    Operation::ForceRemove,
    Operation::Update,
    Operation::Rebuild,
    Operation::Rollback,
    Operation::SwitchGeneration,
    Operation::CollectGarbage,
    Operation::CollectGarbageAll,
    Operation::PruneGenerations,
    Operation::ApplySnippet,
];

/// Operations whose underlying tools have no way to preview the change.
const NO_DRY_RUN: &[Operation] = &[Operation::Rollback, Operation::ForceRemove];

impl Operation {
    pub const ALL: [Operation; 16] = [
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
        Self::ApplySnippet,
        Self::Help,
        Self::Clarify,
    ];

    /// Static safety table.
    pub fn safety(&self) -> Safety {
        match self {
            Self::Install
            | Self::Search
            | Self::ListInstalled
            | Self::ListGenerations
            | Self::Help
            | Self::Clarify => Safety::Safe,
            Self::Remove
            | Self::Update
            | Self::Rebuild
            | Self::Rollback
            | Self::SwitchGeneration
            | Self::CollectGarbage
            | Self::ApplySnippet => Safety::ConfirmRequired,
            Self::ForceRemove | Self::CollectGarbageAll | Self::PruneGenerations => {
                Safety::Destructive
            }
        }
    }

    pub fn modifies_state(&self) -> bool {
        STATE_MODIFYING.contains(self)
    }

    pub fn is_irreversible(&self) -> bool {
        IRREVERSIBLE.contains(self)
    }

    pub fn dry_run_capable(&self) -> bool {
        !NO_DRY_RUN.contains(self)
    }

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
            Self::ApplySnippet => "apply_snippet",
            Self::Help => "help",
            Self::Clarify => "clarify",
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = NixieError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == name)
            .ok_or_else(|| NixieError::MalformedInput(format!("unknown operation '{}'", s)))
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Action / Plan
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub operation: Operation,
    /// Package, store path, generation number or snippet name. For clarify,
    /// the question to show the user.
    pub target: String,
    pub safety: Safety,
    pub dry_run_capable: bool,
}

impl Action {
    pub fn new(operation: Operation, target: impl Into<String>) -> Self {
        Self {
            operation,
            target: target.into(),
            safety: operation.safety(),
            dry_run_capable: operation.dry_run_capable(),
        }
    }

    pub fn clarify(question: impl Into<String>) -> Self {
        Self::new(Operation::Clarify, question)
    }

    /// Short command-like label, also used as the learner's "executed command".
    pub fn label(&self) -> String {
        if self.target.is_empty() || self.operation == Operation::Clarify {
            self.operation.as_str().to_string()
        } else {
            format!("{} {}", self.operation.as_str(), self.target)
        }
    }

    pub fn summary(&self) -> String {
        match self.operation {
            Operation::Clarify => format!("Clarify: {}", self.target),
            _ => format!("{} [{}]", self.label(), self.safety),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "note", rename_all = "snake_case")]
pub enum RollbackStrategy {
    None,
    /// A generation is created before the change, so it can be switched back.
    AutomaticSnapshot,
    /// Human-readable undo hint.
    ManualNote(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub actions: Vec<Action>,
    pub rollback: RollbackStrategy,
    /// Planner remarks shown alongside the summary (substitutions, candidates)
    #[serde(default)]
    pub notes: Vec<String>,
}

impl Plan {
    pub fn new(actions: Vec<Action>, rollback: RollbackStrategy) -> Self {
        Self {
            actions,
            rollback,
            notes: Vec::new(),
        }
    }

    /// A plan holding only the synthetic clarify action.
    pub fn clarify(question: impl Into<String>) -> Self {
        Self::new(vec![Action::clarify(question)], RollbackStrategy::None)
    }

    pub fn is_clarify(&self) -> bool {
        !self.actions.is_empty()
            && self
                .actions
                .iter()
                .all(|a| a.operation == Operation::Clarify)
    }

    /// Question of the clarify action, if this is a clarify plan
    pub fn question(&self) -> Option<&str> {
        self.actions
            .iter()
            .find(|a| a.operation == Operation::Clarify)
            .map(|a| a.target.as_str())
    }

    pub fn highest_safety(&self) -> Safety {
        self.actions
            .iter()
            .map(|a| a.safety)
            .max()
            .unwrap_or(Safety::Safe)
    }

    pub fn requires_confirmation(&self) -> bool {
        self.highest_safety().needs_confirmation()
    }

    pub fn summary(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.actions.iter().map(Action::summary).collect();
        match &self.rollback {
            RollbackStrategy::None => {}
            RollbackStrategy::AutomaticSnapshot => {
                lines.push("Rollback: a new generation is kept, switch back if needed".to_string())
            }
            RollbackStrategy::ManualNote(note) => lines.push(format!("Rollback: {}", note)),
        }
        lines.extend(self.notes.iter().cloned());
        lines
    }
}
