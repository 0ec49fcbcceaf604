//! Command planner: Intent -> Plan.
//!
//! Fails closed. Anything ambiguous (low confidence, unknown package,
//! missing parameter, invalid snippet) becomes a single clarify action,
//! never a guess.

use crate::package_index::PackageIndex;
use crate::session::Session;
use crate::snippet::SnippetStore;
use nixie_shared::config::NixieConfig;
use nixie_shared::intent::{param, Intent, IntentAction};
use nixie_shared::plan::{Action, Operation, Plan, RollbackStrategy};
use std::sync::Arc;
use tracing::{debug, warn};

const PRONOUNS: &[&str] = &["it", "that", "this", "them"];
const MAX_LISTED_CANDIDATES: usize = 5;
const STORE_PREFIX: &str = "/nix/store/";

const NOT_UNDERSTOOD: &str =
    "I'm not sure what you want to do. Try something like 'install firefox', or ask for help.";

pub struct Planner {
    index: Arc<dyn PackageIndex>,
    snippets: Arc<dyn SnippetStore>,
    min_confidence: f64,
    verify_packages: bool,
    atomic_generations: bool,
}

impl Planner {
    pub fn new(
        index: Arc<dyn PackageIndex>,
        snippets: Arc<dyn SnippetStore>,
        config: &NixieConfig,
    ) -> Self {
        Self {
            index,
            snippets,
            min_confidence: config.recognizer.min_confidence,
            verify_packages: config.planner.verify_packages,
            atomic_generations: config.atomic_generations(),
        }
    }

    pub fn with_atomic_generations(mut self, atomic: bool) -> Self {
        self.atomic_generations = atomic;
        self
    }

    pub async fn plan(&self, intent: &Intent, session: &Session) -> Plan {
        if intent.is_unknown() || intent.confidence < self.min_confidence {
            debug!(confidence = intent.confidence, "below threshold, asking");
            return Plan::clarify(NOT_UNDERSTOOD);
        }

        let built: Result<(Vec<Action>, Vec<String>), String> = match intent.action {
            IntentAction::Install => self.plan_install(intent, session).await,
            IntentAction::Remove => self
                .package(intent, session)
                .map(|p| (vec![Action::new(Operation::Remove, p)], Vec::new())),
            IntentAction::ForceRemove => match intent.param(param::STORE_PATH) {
                Some(path) if path.starts_with(STORE_PREFIX) && path.len() > STORE_PREFIX.len() => {
                    Ok((vec![Action::new(Operation::ForceRemove, path)], Vec::new()))
                }
                _ => Err(
                    "Force removal needs a full store path, like /nix/store/<hash>-name."
                        .to_string(),
                ),
            },
            IntentAction::Search => match intent.param(param::QUERY) {
                Some(q) if !q.trim().is_empty() => {
                    Ok((vec![Action::new(Operation::Search, q.trim())], Vec::new()))
                }
                _ => Err("What should I search for?".to_string()),
            },
            IntentAction::SwitchGeneration => match intent.param(param::GENERATION) {
                Some(g) if g.parse::<u64>().is_ok() => {
                    Ok((vec![Action::new(Operation::SwitchGeneration, g)], Vec::new()))
                }
                _ => Err("Which generation number should I switch to?".to_string()),
            },
            IntentAction::CleanUp => Ok((
                vec![
                    Action::new(Operation::CollectGarbage, ""),
                    Action::new(Operation::PruneGenerations, ""),
                ],
                Vec::new(),
            )),
            IntentAction::ApplySnippet => self.plan_snippet(intent),
            IntentAction::ListInstalled => only(Operation::ListInstalled),
            IntentAction::Update => only(Operation::Update),
            IntentAction::Rebuild => only(Operation::Rebuild),
            IntentAction::Rollback => only(Operation::Rollback),
            IntentAction::ListGenerations => only(Operation::ListGenerations),
            IntentAction::CollectGarbage => only(Operation::CollectGarbage),
            IntentAction::CollectGarbageAll => only(Operation::CollectGarbageAll),
            IntentAction::PruneGenerations => only(Operation::PruneGenerations),
            IntentAction::Help => only(Operation::Help),
            IntentAction::Unknown => Err(NOT_UNDERSTOOD.to_string()),
        };

        match built {
            Ok((actions, notes)) => {
                let rollback = self.rollback_for(&actions);
                let mut plan = Plan::new(actions, rollback);
                plan.notes = notes;
                plan
            }
            Err(question) => Plan::clarify(question),
        }
    }

    /// Package parameter with pronouns resolved against the session
    fn package(&self, intent: &Intent, session: &Session) -> Result<String, String> {
        let Some(package) = intent.param(param::PACKAGE) else {
            return Err("Which package do you mean?".to_string());
        };
        if PRONOUNS.contains(&package) {
            return session
                .last_target()
                .map(str::to_string)
                .ok_or_else(|| {
                    format!(
                        "I don't know what '{}' refers to. Which package do you mean?",
                        package
                    )
                });
        }
        Ok(package.to_string())
    }

    async fn plan_install(
        &self,
        intent: &Intent,
        session: &Session,
    ) -> Result<(Vec<Action>, Vec<String>), String> {
        let package = self.package(intent, session)?;
        if !self.verify_packages {
            return Ok((vec![Action::new(Operation::Install, package)], Vec::new()));
        }

        let candidates = match self.index.search(&package).await {
            Ok(c) => c,
            Err(e) => {
                warn!("Package lookup for '{}' failed: {}", package, e);
                return Err(format!(
                    "I couldn't check whether '{}' exists, so nothing was planned. Try again, or search for it.",
                    package
                ));
            }
        };

        if candidates.iter().any(|c| c.attr == package) {
            return Ok((vec![Action::new(Operation::Install, package)], Vec::new()));
        }
        match candidates.as_slice() {
            [] => Err(format!(
                "I couldn't find a package called '{}'. Try 'search {}'.",
                package, package
            )),
            [single] => Ok((
                vec![Action::new(Operation::Install, single.attr.as_str())],
                vec![format!("Using '{}' for '{}'", single.attr, package)],
            )),
            many => {
                let names: Vec<&str> = many
                    .iter()
                    .take(MAX_LISTED_CANDIDATES)
                    .map(|c| c.attr.as_str())
                    .collect();
                let more = if many.len() > MAX_LISTED_CANDIDATES { ", ..." } else { "" };
                Err(format!("Which one did you mean: {}{}?", names.join(", "), more))
            }
        }
    }

    fn plan_snippet(&self, intent: &Intent) -> Result<(Vec<Action>, Vec<String>), String> {
        let Some(name) = intent.param(param::SNIPPET) else {
            return Err("Which configuration snippet should I apply?".to_string());
        };
        let Some(text) = self.snippets.get(name) else {
            return Err(format!("There is no configuration snippet called '{}'.", name));
        };
        if let Err(e) = self.snippets.validate(&text) {
            debug!("Snippet '{}' rejected: {}", name, e.detail);
            return Err(format!("{} ({})", e.explanation, e.detail));
        }
        Ok((
            vec![
                Action::new(Operation::ApplySnippet, name),
                Action::new(Operation::Rebuild, ""),
            ],
            Vec::new(),
        ))
    }

    fn rollback_for(&self, actions: &[Action]) -> RollbackStrategy {
        let irreversible: Vec<String> = actions
            .iter()
            .filter(|a| a.operation.is_irreversible())
            .map(Action::label)
            .collect();
        if !irreversible.is_empty() {
            return RollbackStrategy::ManualNote(format!(
                "This cannot be undone ({})",
                irreversible.join(", ")
            ));
        }

        let Some(first) = actions.iter().find(|a| a.operation.modifies_state()) else {
            return RollbackStrategy::None;
        };
        if self.atomic_generations {
            return RollbackStrategy::AutomaticSnapshot;
        }
        RollbackStrategy::ManualNote(undo_hint(first))
    }
}

fn only(operation: Operation) -> Result<(Vec<Action>, Vec<String>), String> {
    Ok((vec![Action::new(operation, "")], Vec::new()))
}

fn undo_hint(action: &Action) -> String {
    match action.operation {
        Operation::Install => format!("to undo, run 'remove {}'", action.target),
        Operation::Remove => format!("to undo, run 'install {}'", action.target),
        Operation::ApplySnippet => format!(
            "to undo, delete the '{}' snippet from the include directory and rebuild",
            action.target
        ),
        _ => "no restore point is kept, note the current state before running this".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package_index::StaticIndex;
    use crate::session::SessionEntry;
    use nixie_shared::plan::Safety;
    use std::collections::HashMap;

    struct MemorySnippets(HashMap<String, String>);

    impl SnippetStore for MemorySnippets {
        fn get(&self, name: &str) -> Option<String> {
            self.0.get(name).cloned()
        }
    }

    fn planner(names: &[&str]) -> Planner {
        let mut snippets = HashMap::new();
        snippets.insert("ssh".to_string(), "services.openssh.enable = true;".to_string());
        snippets.insert("broken".to_string(), "{ services.openssh.enable = true;".to_string());
        Planner::new(
            Arc::new(StaticIndex::from_names(names)),
            Arc::new(MemorySnippets(snippets)),
            &NixieConfig::default(),
        )
        .with_atomic_generations(true)
    }

    fn intent(action: IntentAction) -> Intent {
        Intent::new(action, 0.9, "test")
    }

    #[tokio::test]
    async fn test_install_exact_match() {
        let p = planner(&["firefox", "firefox-esr"]);
        let install = intent(IntentAction::Install).with_param(param::PACKAGE, "firefox");
        let plan = p.plan(&install, &Session::default()).await;
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].operation, Operation::Install);
        assert_eq!(plan.actions[0].target, "firefox");
        assert_eq!(plan.actions[0].safety, Safety::Safe);
        assert_eq!(plan.rollback, RollbackStrategy::AutomaticSnapshot);
    }

    #[tokio::test]
    async fn test_install_lookup_outcomes() {
        let p = planner(&["firefox", "firefox-esr", "thunderbird"]);
        let session = Session::default();

        let single = p
            .plan(&intent(IntentAction::Install).with_param(param::PACKAGE, "thunder"), &session)
            .await;
        assert_eq!(single.actions[0].target, "thunderbird");
        assert!(single.notes[0].contains("thunderbird"));

        let many = p
            .plan(&intent(IntentAction::Install).with_param(param::PACKAGE, "fire"), &session)
            .await;
        assert!(many.is_clarify());
        assert!(many.question().unwrap().contains("firefox-esr"));

        let none = p
            .plan(&intent(IntentAction::Install).with_param(param::PACKAGE, "emacs"), &session)
            .await;
        assert!(none.is_clarify());
    }

    #[tokio::test]
    async fn test_low_confidence_clarifies() {
        let p = planner(&["firefox"]);
        let low = Intent::new(IntentAction::PruneGenerations, 0.45, "prune?");
        let plan = p.plan(&low, &Session::default()).await;
        assert!(plan.is_clarify());
        assert_eq!(plan.highest_safety(), Safety::Safe);
    }

    #[tokio::test]
    async fn test_pronoun_resolution() {
        let p = planner(&["firefox"]);
        let mut session = Session::default();
        let remove_it = intent(IntentAction::Remove).with_param(param::PACKAGE, "it");
        assert!(p.plan(&remove_it, &session).await.is_clarify());

        session.record(SessionEntry {
            text: "install firefox".to_string(),
            action: IntentAction::Install,
            target: Some("firefox".to_string()),
            command: Some("install firefox".to_string()),
            success: true,
            error: None,
        });
        let plan = p.plan(&remove_it, &session).await;
        assert_eq!(plan.actions[0].operation, Operation::Remove);
        assert_eq!(plan.actions[0].target, "firefox");
        assert_eq!(plan.actions[0].safety, Safety::ConfirmRequired);
    }

    #[tokio::test]
    async fn test_clean_up_and_irreversible_note() {
        let p = planner(&[]);
        let plan = p.plan(&intent(IntentAction::CleanUp), &Session::default()).await;
        let ops: Vec<Operation> = plan.actions.iter().map(|a| a.operation).collect();
        assert_eq!(ops, vec![Operation::CollectGarbage, Operation::PruneGenerations]);
        assert_eq!(plan.highest_safety(), Safety::Destructive);
        assert!(matches!(
            plan.rollback,
            RollbackStrategy::ManualNote(ref n) if n.contains("cannot be undone")
        ));
    }

    #[tokio::test]
    async fn test_force_remove_needs_store_path() {
        let p = planner(&[]);
        let bad = intent(IntentAction::ForceRemove).with_param(param::STORE_PATH, "firefox");
        assert!(p.plan(&bad, &Session::default()).await.is_clarify());
        let good = intent(IntentAction::ForceRemove)
            .with_param(param::STORE_PATH, "/nix/store/abc-firefox");
        let plan = p.plan(&good, &Session::default()).await;
        assert_eq!(plan.actions[0].operation, Operation::ForceRemove);
    }

    #[tokio::test]
    async fn test_snippet_validated_before_planning() {
        let p = planner(&[]);
        let ssh = intent(IntentAction::ApplySnippet).with_param(param::SNIPPET, "ssh");
        let ok = p.plan(&ssh, &Session::default()).await;
        assert_eq!(ok.actions.len(), 2);
        assert_eq!(ok.actions[1].operation, Operation::Rebuild);

        let broken = intent(IntentAction::ApplySnippet).with_param(param::SNIPPET, "broken");
        let broken = p.plan(&broken, &Session::default()).await;
        assert!(broken.is_clarify());
        assert!(broken.question().unwrap().contains("isn't valid"));
    }

    #[tokio::test]
    async fn test_manual_note_without_generations() {
        let p = planner(&["firefox"]).with_atomic_generations(false);
        let install = intent(IntentAction::Install).with_param(param::PACKAGE, "firefox");
        let plan = p.plan(&install, &Session::default()).await;
        assert!(matches!(
            plan.rollback,
            RollbackStrategy::ManualNote(ref n) if n.contains("remove firefox")
        ));

        let read_only = p.plan(&intent(IntentAction::ListGenerations), &Session::default()).await;
        assert_eq!(read_only.rollback, RollbackStrategy::None);
    }
}
