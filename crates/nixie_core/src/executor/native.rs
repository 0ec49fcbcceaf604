//! Native binding adapter.
//!
//! Runs operations in-process through a `NativeLibrary` instead of spawning
//! tools. The shipped library, `ProfileLibrary`, works directly on the Nix
//! profile tree (`system` -> `system-N-link` -> store path) for the
//! generation operations. Anything the library doesn't support is routed to
//! the process adapter by the selector.
//!
//! `NativeError` is the library's own error type. It never leaves this
//! module's adapter: `execute` hands it to the normalizer.

use super::normalizer::{normalize, RawOutcome};
use super::{help_text, Adapter, ProgressSink};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use nixie_shared::plan::{Action, Operation};
use nixie_shared::request::Mode;
use nixie_shared::result::{Backend, ExecutionResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum NativeError {
    #[error("generation {0} does not exist")]
    MissingGeneration(u64),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("profile busy: {0}")]
    Busy(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("profile io: {0}")]
    Io(#[from] std::io::Error),
}

/// One call into the library
#[derive(Debug, Clone)]
pub struct NativeCall {
    pub operation: Operation,
    pub target: String,
    /// Report what would happen without changing anything
    pub analyze_only: bool,
}

#[async_trait]
pub trait NativeLibrary: Send + Sync {
    fn supports(&self, operation: Operation) -> bool;

    async fn call(&self, call: NativeCall, progress: &ProgressSink) -> Result<String, NativeError>;
}

// =============================================================================
// Profile library
// =============================================================================

const PROFILE: &str = "system";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub number: u64,
    pub created: Option<DateTime<Local>>,
    pub current: bool,
}

/// In-process generation management on a profiles directory.
pub struct ProfileLibrary {
    dir: PathBuf,
}

impl ProfileLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn link_name(number: u64) -> String {
        format!("{}-{}-link", PROFILE, number)
    }

    fn parse_link_name(name: &str) -> Option<u64> {
        name.strip_prefix("system-")?.strip_suffix("-link")?.parse().ok()
    }

    pub fn current_generation(&self) -> Result<Option<u64>, NativeError> {
        let target = match fs::read_link(self.dir.join(PROFILE)) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(target
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(Self::parse_link_name))
    }

    pub fn generations(&self) -> Result<Vec<Generation>, NativeError> {
        let current = self.current_generation()?;
        let mut generations = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(number) = name.to_str().and_then(Self::parse_link_name) else {
                continue;
            };
            let created = fs::symlink_metadata(entry.path())
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Local>::from);
            generations.push(Generation {
                number,
                created,
                current: Some(number) == current,
            });
        }
        generations.sort_by_key(|g| g.number);
        Ok(generations)
    }

    fn list(&self) -> Result<String, NativeError> {
        let lines: Vec<String> = self
            .generations()?
            .iter()
            .map(|g| {
                let created = g
                    .created
                    .map(|c| c.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                let marker = if g.current { "   (current)" } else { "" };
                format!("{:>5}   {}{}", g.number, created, marker)
            })
            .collect();
        Ok(lines.join("\n"))
    }

    fn switch(
        &self,
        target: &str,
        analyze_only: bool,
        progress: &ProgressSink,
    ) -> Result<String, NativeError> {
        let number: u64 = target
            .trim()
            .parse()
            .map_err(|_| {
                NativeError::InvalidArgument(format!("'{}' is not a generation number", target))
            })?;
        let link = Self::link_name(number);
        if fs::symlink_metadata(self.dir.join(&link)).is_err() {
            return Err(NativeError::MissingGeneration(number));
        }
        let from = self.current_generation()?;
        let from_text = from.map(|n| n.to_string()).unwrap_or_else(|| "none".to_string());

        if analyze_only {
            return Ok(format!(
                "would switch profile from generation {} to {}",
                from_text, number
            ));
        }

        progress.emit(
            Operation::SwitchGeneration,
            format!("switching to generation {}", number),
            Some(0.0),
        );
        let tmp = self.dir.join(format!(".{}.nixie-{}", PROFILE, std::process::id()));
        if let Err(e) = std::os::unix::fs::symlink(&link, &tmp) {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                return Err(NativeError::Busy("another switch is in progress".to_string()));
            }
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp, self.dir.join(PROFILE)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        progress.emit(Operation::SwitchGeneration, "profile link updated".to_string(), Some(1.0));
        info!("Switched {} from generation {} to {}", self.dir.display(), from_text, number);
        Ok(format!(
            "switching profile from version {} to {}",
            from_text, number
        ))
    }

    fn call_blocking(
        &self,
        call: &NativeCall,
        progress: &ProgressSink,
    ) -> Result<String, NativeError> {
        match call.operation {
            Operation::ListGenerations => self.list(),
            Operation::SwitchGeneration => self.switch(&call.target, call.analyze_only, progress),
            Operation::PruneGenerations => self.prune(call.analyze_only, progress),
            other => Err(NativeError::Unsupported(other.to_string())),
        }
    }

    fn prune(&self, analyze_only: bool, progress: &ProgressSink) -> Result<String, NativeError> {
        let old: Vec<Generation> = self.generations()?.into_iter().filter(|g| !g.current).collect();
        if old.is_empty() {
            return Ok("no old generations to remove".to_string());
        }

        let verb = if analyze_only { "would remove" } else { "removing" };
        let mut lines = Vec::with_capacity(old.len());
        for (i, generation) in old.iter().enumerate() {
            lines.push(format!("{} generation {}", verb, generation.number));
            if analyze_only {
                continue;
            }
            fs::remove_file(self.dir.join(Self::link_name(generation.number)))?;
            progress.emit(
                Operation::PruneGenerations,
                format!("removed generation {}", generation.number),
                Some((i + 1) as f32 / old.len() as f32),
            );
        }
        Ok(lines.join("\n"))
    }
}

#[async_trait]
impl NativeLibrary for ProfileLibrary {
    fn supports(&self, operation: Operation) -> bool {
        matches!(
            operation,
            Operation::ListGenerations | Operation::SwitchGeneration | Operation::PruneGenerations
        )
    }

    async fn call(&self, call: NativeCall, progress: &ProgressSink) -> Result<String, NativeError> {
        debug!(operation = %call.operation, analyze_only = call.analyze_only, "native call");
        let library = ProfileLibrary::new(self.dir.clone());
        let progress = progress.clone();
        tokio::task::spawn_blocking(move || library.call_blocking(&call, &progress))
            .await
            .unwrap_or_else(|e| Err(NativeError::Io(std::io::Error::other(e))))
    }
}

// =============================================================================
// Adapter
// =============================================================================

pub struct NativeAdapter {
    library: Arc<dyn NativeLibrary>,
    timeout: Duration,
    progress: ProgressSink,
}

impl NativeAdapter {
    pub fn new(library: Arc<dyn NativeLibrary>, timeout: Duration) -> Self {
        Self {
            library,
            timeout,
            progress: ProgressSink::default(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }
}

#[async_trait]
impl Adapter for NativeAdapter {
    fn backend(&self) -> Backend {
        Backend::Native
    }

    fn supports(&self, operation: Operation) -> bool {
        matches!(operation, Operation::Help | Operation::Clarify)
            || self.library.supports(operation)
    }

    fn supports_dry_run(&self, operation: Operation) -> bool {
        self.supports(operation) && operation.dry_run_capable()
    }

    async fn execute(&self, action: &Action, mode: Mode) -> ExecutionResult {
        let started = Instant::now();
        let outcome = match action.operation {
            Operation::Help => RawOutcome::Native(Ok(help_text().to_string())),
            Operation::Clarify => RawOutcome::Native(Ok(String::new())),
            op if !self.library.supports(op) => {
                RawOutcome::Native(Err(NativeError::Unsupported(op.to_string())))
            }
            op => {
                let call = NativeCall {
                    operation: op,
                    target: action.target.clone(),
                    analyze_only: mode.is_dry_run(),
                };
                self.progress.emit(op, format!("starting {}", action.label()), Some(0.0));
                match timeout(self.timeout, self.library.call(call, &self.progress)).await {
                    Ok(result) => RawOutcome::Native(result),
                    Err(_) => RawOutcome::TimedOut {
                        after: self.timeout,
                        pid: None,
                        partial_output: String::new(),
                    },
                }
            }
        };
        let result = normalize(outcome, Backend::Native, started.elapsed());
        self.progress.emit(
            action.operation,
            if result.success { "done".to_string() } else { "failed".to_string() },
            Some(1.0),
        );
        result
    }
}
