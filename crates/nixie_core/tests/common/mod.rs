//! Test doubles shared by the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use nixie_core::learner::LearnerHandle;
use nixie_core::package_index::StaticIndex;
use nixie_core::snippet::SnippetStore;
use nixie_core::{Adapter, Confirmer, NativeProbe, Pipeline, PipelineBuilder};
use nixie_shared::config::NixieConfig;
use nixie_shared::plan::{Action, Operation, Plan};
use nixie_shared::request::Mode;
use nixie_shared::result::{Backend, ErrorKind, ExecutionError, ExecutionResult};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Records every call; optionally fails one operation with a given kind.
pub struct RecordingAdapter {
    backend: Backend,
    fail: Option<(Operation, ErrorKind)>,
    calls: Mutex<Vec<(Operation, String, Mode)>>,
}

impl RecordingAdapter {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            fail: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(backend: Backend, operation: Operation, kind: ErrorKind) -> Self {
        Self {
            fail: Some((operation, kind)),
            ..Self::new(backend)
        }
    }

    pub fn calls(&self) -> Vec<(Operation, String, Mode)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.calls().into_iter().map(|(op, _, _)| op).collect()
    }
}

#[async_trait]
impl Adapter for RecordingAdapter {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn supports(&self, _operation: Operation) -> bool {
        true
    }

    fn supports_dry_run(&self, operation: Operation) -> bool {
        operation.dry_run_capable()
    }

    async fn execute(&self, action: &Action, mode: Mode) -> ExecutionResult {
        self.calls
            .lock()
            .unwrap()
            .push((action.operation, action.target.clone(), mode));
        match self.fail {
            Some((op, kind)) if op == action.operation => ExecutionResult::failed(
                ExecutionError::new(kind, format!("{} failed", op)),
                "",
                0.1,
                self.backend,
            ),
            _ => ExecutionResult::ok(format!("ran {}", action.label()), 0.1, self.backend),
        }
    }
}

/// Probe that never finds a native backend
pub struct NoNative;

#[async_trait]
impl NativeProbe for NoNative {
    async fn probe(&self) -> Option<Arc<dyn Adapter>> {
        None
    }
}

#[derive(Default)]
pub struct MemorySnippets(pub BTreeMap<String, String>);

impl SnippetStore for MemorySnippets {
    fn get(&self, name: &str) -> Option<String> {
        self.0.get(name).cloned()
    }
}

pub struct FixedAnswer(pub bool);

impl Confirmer for FixedAnswer {
    fn confirm(&self, _plan: &Plan) -> bool {
        self.0
    }
}

pub const PACKAGES: &[&str] = &["firefox", "vim", "vscode", "git", "htop", "ripgrep"];

/// Pipeline over fakes: fallback-only, static index, no learner unless given.
pub fn pipeline_with(
    adapter: Arc<RecordingAdapter>,
    confirmer: Option<bool>,
    learner: LearnerHandle,
) -> Pipeline {
    let mut config = NixieConfig::default();
    config.executor.force_fallback = true;
    let mut builder = PipelineBuilder::new(config)
        .package_index(Arc::new(StaticIndex::from_names(PACKAGES)))
        .snippets(Arc::new(MemorySnippets::default()))
        .fallback(adapter)
        .learner(learner)
        .atomic_generations(true);
    if let Some(answer) = confirmer {
        builder = builder.confirmer(Box::new(FixedAnswer(answer)));
    }
    builder.build().unwrap()
}

pub fn pipeline(adapter: Arc<RecordingAdapter>, confirmer: Option<bool>) -> Pipeline {
    pipeline_with(adapter, confirmer, LearnerHandle::disabled())
}

pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}
