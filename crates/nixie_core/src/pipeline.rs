//! Request pipeline: resolve, plan, gate, execute, learn.
//!
//! One request at a time (`handle` takes `&mut self`), so the session always
//! holds the previous outcome before the next plan is made.

use crate::executor::discovery::{DiscoveryProbe, DiscoverySettings};
use crate::executor::process::ProcessAdapter;
use crate::executor::{Adapter, NativeProbe, ProgressSink, Selector};
use crate::learner::{LearnerHandle, Observation};
use crate::package_index::{NixSearchIndex, PackageIndex};
use crate::planner::Planner;
use crate::recognizer::{normalize, Recognizer};
use crate::session::{Session, SessionEntry};
use crate::snippet::{DirSnippetStore, SnippetStore};
use nixie_shared::config::NixieConfig;
use nixie_shared::error::Result;
use nixie_shared::intent::Intent;
use nixie_shared::plan::Plan;
use nixie_shared::preferences::LearnedPreferences;
use nixie_shared::request::{Request, Response, ResponseStatus};
use nixie_shared::result::{ExecutionResult, SIGNATURE_TARGET_CHARS};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Asks the user to approve a plan that changes the system.
pub trait Confirmer: Send + Sync {
    fn confirm(&self, plan: &Plan) -> bool;
}

pub struct PipelineBuilder {
    config: NixieConfig,
    index: Option<Arc<dyn PackageIndex>>,
    snippets: Option<Arc<dyn SnippetStore>>,
    fallback: Option<Arc<dyn Adapter>>,
    probe: Option<Box<dyn NativeProbe>>,
    learner: Option<LearnerHandle>,
    confirmer: Option<Box<dyn Confirmer>>,
    progress: ProgressSink,
    atomic_generations: Option<bool>,
}

impl PipelineBuilder {
    pub fn new(config: NixieConfig) -> Self {
        Self {
            config,
            index: None,
            snippets: None,
            fallback: None,
            probe: None,
            learner: None,
            confirmer: None,
            progress: ProgressSink::default(),
            atomic_generations: None,
        }
    }

    pub fn package_index(mut self, index: Arc<dyn PackageIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn snippets(mut self, snippets: Arc<dyn SnippetStore>) -> Self {
        self.snippets = Some(snippets);
        self
    }

    pub fn fallback(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.fallback = Some(adapter);
        self
    }

    pub fn native_probe(mut self, probe: Box<dyn NativeProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn learner(mut self, learner: LearnerHandle) -> Self {
        self.learner = Some(learner);
        self
    }

    pub fn confirmer(mut self, confirmer: Box<dyn Confirmer>) -> Self {
        self.confirmer = Some(confirmer);
        self
    }

    pub fn progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    pub fn atomic_generations(mut self, atomic: bool) -> Self {
        self.atomic_generations = Some(atomic);
        self
    }

    /// Assemble the pipeline. Spawns the learner worker unless one was
    /// supplied, so this must run inside a tokio runtime.
    pub fn build(self) -> Result<Pipeline> {
        let config = self.config;
        let action_timeout = Duration::from_secs(config.executor.action_timeout_secs);

        let recognizer = Recognizer::new(config.recognizer.min_confidence)?;
        let index = self
            .index
            .unwrap_or_else(|| Arc::new(NixSearchIndex::new(action_timeout)));
        let snippets = self
            .snippets
            .unwrap_or_else(|| Arc::new(DirSnippetStore::new(config.planner.snippet_dir())));

        let mut planner = Planner::new(index, Arc::clone(&snippets), &config);
        if let Some(atomic) = self.atomic_generations {
            planner = planner.with_atomic_generations(atomic);
        }

        let fallback = self
            .fallback
            .unwrap_or_else(|| Arc::new(ProcessAdapter::new(&config, snippets)));
        let probe = if config.executor.force_fallback {
            info!("Native backend disabled, every action runs through external tools");
            None
        } else {
            let progress = self.progress;
            Some(self.probe.unwrap_or_else(|| {
                Box::new(
                    DiscoveryProbe::new(DiscoverySettings::from_config(&config), action_timeout)
                        .with_progress(progress),
                )
            }))
        };

        let learner = self
            .learner
            .unwrap_or_else(|| LearnerHandle::spawn(&config.learner, &config.state_dir()));

        Ok(Pipeline {
            recognizer,
            planner,
            selector: Selector::new(fallback, probe),
            learner,
            session: Session::new(config.session.window),
            confirmer: self.confirmer,
        })
    }
}

pub struct Pipeline {
    recognizer: Recognizer,
    planner: Planner,
    selector: Selector,
    learner: LearnerHandle,
    session: Session,
    confirmer: Option<Box<dyn Confirmer>>,
}

impl Pipeline {
    pub fn from_config(config: NixieConfig) -> Result<Self> {
        PipelineBuilder::new(config).build()
    }

    pub fn learner(&self) -> &LearnerHandle {
        &self.learner
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Handle one request. Only structurally broken input is an error;
    /// every other outcome is a Response.
    pub async fn handle(&mut self, request: Request) -> Result<Response> {
        let request_id = Uuid::new_v4();
        let prefs = self.learner.snapshot();
        let intent = self.recognizer.resolve(&request.text, &prefs.aliases)?;
        let plan = self.planner.plan(&intent, &self.session).await;
        debug!(%request_id, action = %intent.action, actions = plan.actions.len(), "planned");

        let mut suggestions = Vec::new();
        if let Some(notice) = alias_notice(&request.text, &intent) {
            suggestions.push(notice);
        }

        if plan.is_clarify() {
            return Ok(self.clarify(request_id, request, intent, plan, &prefs, suggestions));
        }

        let blocked = !request.mode.is_dry_run()
            && plan.requires_confirmation()
            && !request.non_interactive
            && !self.confirmer.as_ref().is_some_and(|c| c.confirm(&plan));
        if blocked {
            info!("Waiting for confirmation: {} plan", plan.highest_safety());
            self.session.record(SessionEntry {
                text: request.text.clone(),
                action: intent.action,
                target: plan_target(&plan),
                command: None,
                success: false,
                error: None,
            });
            return Ok(Response {
                request_id,
                plan_summary: plan.summary(),
                status: ResponseStatus::ConfirmationRequired,
                result: None,
                suggestions,
                message: format!(
                    "Nothing has been changed yet. This plan has {} steps, so it needs your go-ahead: confirm it, or run it again with --yes.",
                    plan.highest_safety()
                ),
                verbosity: prefs.verbosity(),
                intent,
            });
        }

        let result = self.selector.execute(&plan, request.mode).await;
        let command = plan_command(&plan);
        let status = ResponseStatus::from_result(&result);

        let mut observation = Observation::new(
            request.text.clone(),
            Some(command.clone()),
            result.success,
            result.error_kind(),
        )
        .with_timing(result.duration, Some(result.backend_used));

        match &result.error {
            Some(error) => {
                let signature = match plan.actions.get(result.completed_actions) {
                    Some(failed) => error.signature(failed.operation.as_str(), &failed.target),
                    None => error.signature("plan", ""),
                };
                if let Some(fix) = prefs.solution_for(&signature) {
                    suggestions.push(format!("This worked before: {}", fix));
                }
                observation = observation.with_signature(signature);
            }
            None => {
                if let Some(next) = prefs.next_command(&command) {
                    suggestions.push(format!("You often run next: {}", next));
                }
            }
        }

        self.learner.observe(observation);
        self.session.record(SessionEntry {
            text: request.text.clone(),
            action: intent.action,
            target: plan_target(&plan),
            command: Some(command),
            success: result.success,
            error: result.error_kind(),
        });

        Ok(Response {
            request_id,
            plan_summary: plan.summary(),
            status,
            message: outcome_message(&result, request.mode.is_dry_run()),
            result: Some(result),
            suggestions,
            verbosity: prefs.verbosity(),
            intent,
        })
    }

    fn clarify(
        &mut self,
        request_id: Uuid,
        request: Request,
        intent: Intent,
        plan: Plan,
        prefs: &LearnedPreferences,
        mut suggestions: Vec<String>,
    ) -> Response {
        let signature = clarify_signature(&request.text, &intent);
        if let Some(fix) = prefs.solution_for(&signature) {
            suggestions.push(format!("This worked before: {}", fix));
        }

        self.learner.observe(
            Observation::new(request.text.clone(), None, false, None).with_signature(signature),
        );
        self.session.record(SessionEntry {
            text: request.text,
            action: intent.action,
            target: None,
            command: None,
            success: false,
            error: None,
        });

        Response {
            request_id,
            plan_summary: plan.summary(),
            status: ResponseStatus::ClarificationNeeded,
            result: None,
            suggestions,
            message: plan.question().unwrap_or_default().to_string(),
            verbosity: prefs.verbosity(),
            intent,
        }
    }
}

/// Label the learner and session know a plan by
fn plan_command(plan: &Plan) -> String {
    let labels: Vec<String> = plan.actions.iter().map(|a| a.label()).collect();
    labels.join("; ")
}

fn plan_target(plan: &Plan) -> Option<String> {
    plan.actions
        .iter()
        .map(|a| a.target.as_str())
        .find(|t| !t.is_empty())
        .map(str::to_string)
}

/// Recovery key for a request that ended in a question. The whole
/// normalized request is kept, so a fix for "grab firefox" is never
/// offered for "grab htop".
fn clarify_signature(text: &str, intent: &Intent) -> String {
    let normalized: String = normalize(text)
        .chars()
        .take(SIGNATURE_TARGET_CHARS)
        .collect();
    if intent.is_unknown() {
        format!("unrecognized:{}", normalized)
    } else {
        format!("clarify:{}:{}", intent.action, normalized)
    }
}

/// "Read 'grab' as 'install'" when learned aliases changed the input
fn alias_notice(text: &str, intent: &Intent) -> Option<String> {
    let rewritten = intent.rewritten.as_deref()?;
    let normalized = normalize(text);
    let pairs: Vec<String> = normalized
        .split_whitespace()
        .zip(rewritten.split_whitespace())
        .filter(|(a, b)| a != b)
        .map(|(a, b)| format!("'{}' as '{}'", a, b))
        .collect();
    if pairs.is_empty() {
        return None;
    }
    Some(format!("Read {}", pairs.join(", ")))
}

fn outcome_message(result: &ExecutionResult, dry_run: bool) -> String {
    let Some(error) = &result.error else {
        return if dry_run {
            "Dry run finished. Nothing was changed.".to_string()
        } else {
            "Done.".to_string()
        };
    };
    let mut message = error.explanation.clone();
    if result.incomplete {
        message.push_str(" The operation was stopped before it finished and was not retried.");
        if result.snapshot_available {
            message.push_str(
                " The generation from before the change is still there if you need to switch back.",
            );
        }
    }
    message
}
