//! Backend selection and execution.
//!
//! Two adapters share one contract (`Adapter`): the native adapter runs
//! operations in-process, the process adapter spawns the Nix tools. The
//! `Selector` probes for the native one once, then routes each action to
//! whichever adapter can run it. Callers only ever see `ExecutionResult`.

pub mod discovery;
pub mod native;
pub mod normalizer;
pub mod process;

use async_trait::async_trait;
use nixie_shared::plan::{Action, Operation, Plan, RollbackStrategy};
use nixie_shared::request::Mode;
use nixie_shared::result::{Backend, ErrorKind, ExecutionError, ExecutionResult};
use std::sync::Arc;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

/// Lets the `nix` subcommands run on hosts that have not enabled them.
pub const NIX_FEATURE_FLAGS: [&str; 2] = ["--extra-experimental-features", "nix-command flakes"];

// =============================================================================
// Progress
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub operation: Operation,
    pub message: String,
    /// 0.0 ..= 1.0 when the backend can tell
    pub fraction: Option<f32>,
}

/// Where adapters stream progress. The default sink drops everything.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink(Option<mpsc::UnboundedSender<ProgressEvent>>);

impl ProgressSink {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self(Some(tx))
    }

    pub fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.0 {
            // receiver gone just means nobody is watching
            let _ = tx.send(event);
        }
    }

    pub(crate) fn emit(&self, operation: Operation, message: String, fraction: Option<f32>) {
        self.send(ProgressEvent {
            operation,
            message,
            fraction,
        });
    }
}

pub fn help_text() -> &'static str {
    "Things you can ask:\n\
     \x20 install firefox            remove firefox\n\
     \x20 search for a pdf viewer    list installed packages\n\
     \x20 update the system          rebuild\n\
     \x20 roll back                  list generations\n\
     \x20 switch to generation 42    delete old generations\n\
     \x20 collect garbage            clean up\n\
     \x20 apply snippet rust-dev\n\
     Add --dry-run to see what would happen without changing anything."
}

// =============================================================================
// Adapter contract
// =============================================================================

#[async_trait]
pub trait Adapter: Send + Sync {
    fn backend(&self) -> Backend;

    fn supports(&self, operation: Operation) -> bool;

    fn supports_dry_run(&self, operation: Operation) -> bool;

    /// Run one action. Never panics and never returns a raw backend error.
    async fn execute(&self, action: &Action, mode: Mode) -> ExecutionResult;
}

/// Finds and builds the native adapter, if this machine has one.
#[async_trait]
pub trait NativeProbe: Send + Sync {
    async fn probe(&self) -> Option<Arc<dyn Adapter>>;
}

// =============================================================================
// Selector
// =============================================================================

pub struct Selector {
    fallback: Arc<dyn Adapter>,
    probe: Option<Box<dyn NativeProbe>>,
    /// Probe result, computed on first use and kept for the selector's lifetime
    native: OnceCell<Option<Arc<dyn Adapter>>>,
}

impl Selector {
    pub fn new(fallback: Arc<dyn Adapter>, probe: Option<Box<dyn NativeProbe>>) -> Self {
        Self {
            fallback,
            probe,
            native: OnceCell::new(),
        }
    }

    /// Never probes; every action goes to the fallback adapter.
    pub fn fallback_only(fallback: Arc<dyn Adapter>) -> Self {
        Self::new(fallback, None)
    }

    async fn native(&self) -> Option<Arc<dyn Adapter>> {
        self.native
            .get_or_init(|| async {
                match &self.probe {
                    Some(probe) => {
                        let found = probe.probe().await;
                        if found.is_none() {
                            info!("Native backend unavailable, using fallback for everything");
                        }
                        found
                    }
                    None => None,
                }
            })
            .await
            .clone()
    }

    pub async fn native_available(&self) -> bool {
        self.native().await.is_some()
    }

    /// Adapter an operation is routed to
    pub async fn adapter_for(&self, operation: Operation) -> Arc<dyn Adapter> {
        match self.native().await {
            Some(native) if native.supports(operation) => native,
            _ => Arc::clone(&self.fallback),
        }
    }

    /// Run a plan's actions in order, stopping at the first failure.
    ///
    /// In dry-run mode every action is checked first; if any of them can't
    /// be previewed nothing runs at all.
    pub async fn execute(&self, plan: &Plan, mode: Mode) -> ExecutionResult {
        let mut routed = Vec::with_capacity(plan.actions.len());
        for action in &plan.actions {
            routed.push((action, self.adapter_for(action.operation).await));
        }

        if mode.is_dry_run() {
            for (action, adapter) in &routed {
                if !action.dry_run_capable || !adapter.supports_dry_run(action.operation) {
                    warn!("Dry run refused: {} cannot be previewed", action.label());
                    return ExecutionResult::failed(
                        ExecutionError::new(
                            ErrorKind::UnsupportedDryRun,
                            format!(
                                "{} has no dry-run mode on the {} backend",
                                action.label(),
                                adapter.backend()
                            ),
                        ),
                        "",
                        0.0,
                        adapter.backend(),
                    );
                }
            }
        }

        let mut outputs: Vec<String> = Vec::new();
        let mut duration = 0.0;
        let mut backend = self.fallback.backend();
        let mut completed = 0;

        for (action, adapter) in routed {
            backend = adapter.backend();
            debug!(backend = %backend, dry_run = mode.is_dry_run(), "executing {}", action.label());
            let result = adapter.execute(action, mode).await;
            duration += result.duration;
            if !result.output.trim().is_empty() {
                outputs.push(result.output);
            }
            match result.error {
                Some(error) => {
                    info!("{} failed on {}: {}", action.label(), backend, error.kind);
                    let mut failed =
                        ExecutionResult::failed(error, outputs.join("\n"), duration, backend);
                    failed.completed_actions = completed;
                    failed.snapshot_available = failed.incomplete
                        && matches!(plan.rollback, RollbackStrategy::AutomaticSnapshot);
                    return failed;
                }
                None => completed += 1,
            }
        }

        let mut result = ExecutionResult::ok(outputs.join("\n"), duration, backend);
        result.completed_actions = completed;
        result
    }
}
