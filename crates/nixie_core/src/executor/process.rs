//! Process fallback adapter.
//!
//! Spawns the standard Nix command-line tools. The argv for each operation
//! comes from a template table (built-in, overridable per operation in
//! config); the action target is substituted into a single argv token and
//! never passes through a shell.

use super::normalizer::{normalize, RawOutcome, MAX_OUTPUT_BYTES};
use super::{help_text, Adapter};
use crate::snippet::{self, SnippetStore};
use async_trait::async_trait;
use nixie_shared::config::{NixieConfig, ToolTemplate};
use nixie_shared::plan::{Action, Operation};
use nixie_shared::request::Mode;
use nixie_shared::result::{Backend, ErrorKind, ExecutionError, ExecutionResult};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const TARGET: &str = "{target}";
const SYSTEM_PROFILE: &str = "/nix/var/nix/profiles/system";

/// How long to wait for output after the tool's processes were killed
const OUTPUT_GRACE: Duration = Duration::from_secs(1);

/// Built-in tool table
pub fn default_tools() -> BTreeMap<Operation, ToolTemplate> {
    let mut tools = BTreeMap::new();
    tools.insert(
        Operation::Install,
        ToolTemplate::new(
            &["nix-env", "-iA", "nixos.{target}"],
            Some(&["nix-env", "-iA", "nixos.{target}", "--dry-run"]),
        ),
    );
    tools.insert(
        Operation::Remove,
        ToolTemplate::new(
            &["nix-env", "--uninstall", "{target}"],
            Some(&["nix-env", "--uninstall", "{target}", "--dry-run"]),
        ),
    );
    tools.insert(
        Operation::ForceRemove,
        ToolTemplate::new(&["nix-store", "--delete", "--ignore-liveness", "{target}"], None),
    );
    let search: &[&str] = &[
        "nix",
        "--extra-experimental-features",
        "nix-command flakes",
        "search",
        "nixpkgs",
        "{target}",
    ];
    tools.insert(Operation::Search, ToolTemplate::new(search, Some(search)));
    let installed: &[&str] = &["nix-env", "--query", "--installed"];
    tools.insert(Operation::ListInstalled, ToolTemplate::new(installed, Some(installed)));
    tools.insert(
        Operation::Update,
        ToolTemplate::new(
            &["nixos-rebuild", "switch", "--upgrade"],
            Some(&["nixos-rebuild", "dry-build", "--upgrade"]),
        ),
    );
    tools.insert(
        Operation::Rebuild,
        ToolTemplate::new(&["nixos-rebuild", "switch"], Some(&["nixos-rebuild", "dry-build"])),
    );
    tools.insert(
        Operation::Rollback,
        ToolTemplate::new(&["nixos-rebuild", "switch", "--rollback"], None),
    );
    tools.insert(
        Operation::SwitchGeneration,
        ToolTemplate::new(
            &["nix-env", "--profile", SYSTEM_PROFILE, "--switch-generation", "{target}"],
            Some(&[
                "nix-env",
                "--profile",
                SYSTEM_PROFILE,
                "--switch-generation",
                "{target}",
                "--dry-run",
            ]),
        ),
    );
    let generations: &[&str] = &["nix-env", "--profile", SYSTEM_PROFILE, "--list-generations"];
    tools.insert(Operation::ListGenerations, ToolTemplate::new(generations, Some(generations)));
    tools.insert(
        Operation::CollectGarbage,
        ToolTemplate::new(&["nix-collect-garbage"], Some(&["nix-collect-garbage", "--dry-run"])),
    );
    tools.insert(
        Operation::CollectGarbageAll,
        ToolTemplate::new(
            &["nix-collect-garbage", "-d"],
            Some(&["nix-collect-garbage", "-d", "--dry-run"]),
        ),
    );
    tools.insert(
        Operation::PruneGenerations,
        ToolTemplate::new(
            &["nix-env", "--profile", SYSTEM_PROFILE, "--delete-generations", "old"],
            Some(&[
                "nix-env",
                "--profile",
                SYSTEM_PROFILE,
                "--delete-generations",
                "old",
                "--dry-run",
            ]),
        ),
    );
    tools
}

/// Targets that could be read as an option or split into several arguments are refused.
pub fn validate_target(target: &str) -> Result<(), ExecutionError> {
    if target.starts_with('-') || target.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ExecutionError::new(
            ErrorKind::MalformedInput,
            format!("refusing unsafe argument {:?}", target),
        )
        .with_explanation("That name can't be passed to the system tools safely."));
    }
    Ok(())
}

/// Substitute the target into each token of a template
pub fn render_argv(template: &[String], target: &str) -> Result<Vec<String>, ExecutionError> {
    if template.iter().any(|t| t.contains(TARGET)) {
        validate_target(target)?;
    }
    Ok(template.iter().map(|t| t.replace(TARGET, target)).collect())
}

/// What came back from one spawned tool
#[derive(Debug)]
pub struct ProcessOutcome {
    pub pid: Option<u32>,
    pub outcome: RawOutcome,
}

/// Spawn argv with a hard timeout covering both the run and the output
/// collection. The tool leads its own process group; on timeout the whole
/// group is killed and the child reaped before this returns.
pub async fn run_tool(argv: &[String], limit: Duration) -> ProcessOutcome {
    let Some((program, args)) = argv.split_first() else {
        return ProcessOutcome {
            pid: None,
            outcome: RawOutcome::Refused(ExecutionError::new(
                ErrorKind::MalformedInput,
                "empty command",
            )),
        };
    };

    let started = Instant::now();
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(error) => {
            return ProcessOutcome {
                pid: None,
                outcome: RawOutcome::SpawnFailed {
                    program: program.clone(),
                    error,
                },
            }
        }
    };
    let pid = child.id();
    debug!(pid = ?pid, "spawned {}", argv.join(" "));

    let mut stdout = child.stdout.take().map(read_capped);
    let mut stderr = child.stderr.take().map(read_capped);

    match timeout(limit, child.wait()).await {
        Ok(Ok(status)) => {
            // Background processes the tool left behind may still hold the pipes
            let remaining = limit.saturating_sub(started.elapsed());
            let mut drained = (None, None);
            let finished = timeout(remaining, async {
                drained.0 = Some(join_output(&mut stdout).await);
                drained.1 = Some(join_output(&mut stderr).await);
            })
            .await;
            if finished.is_err() {
                warn!(pid = ?pid, "{} left processes holding its output, killing them", program);
                kill_group(pid);
            }
            let stdout = match drained.0 {
                Some(out) => out,
                None => collect_with_grace(stdout).await,
            };
            let stderr = match drained.1 {
                Some(err) => err,
                None => collect_with_grace(stderr).await,
            };
            ProcessOutcome {
                pid,
                outcome: RawOutcome::Exited {
                    code: status.code(),
                    stdout,
                    stderr,
                },
            }
        }
        Ok(Err(error)) => ProcessOutcome {
            pid,
            outcome: RawOutcome::SpawnFailed {
                program: program.clone(),
                error,
            },
        },
        Err(_) => {
            warn!(pid = ?pid, "{} exceeded {}s, killing", program, limit.as_secs());
            kill_group(pid);
            // kill() also waits for the child, so it is reaped here
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {}: {}", program, e);
            }
            let partial = collect_with_grace(stdout).await;
            if let Some(handle) = stderr {
                handle.abort();
            }
            ProcessOutcome {
                pid,
                outcome: RawOutcome::TimedOut {
                    after: limit,
                    pid,
                    partial_output: partial,
                },
            }
        }
    }
}

/// SIGKILL every process in the group led by `pid`
fn kill_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
        debug!(
            "process group {} already gone: {}",
            pgid,
            std::io::Error::last_os_error()
        );
    }
}

fn read_capped<R>(mut reader: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut kept = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    // keep draining so the child never blocks on a full pipe
                    let room = MAX_OUTPUT_BYTES.saturating_sub(kept.len());
                    kept.extend_from_slice(&buf[..n.min(room)]);
                }
            }
        }
        String::from_utf8_lossy(&kept).into_owned()
    })
}

/// Wait for a reader to hit end of stream; the slot is emptied once joined.
async fn join_output(handle: &mut Option<JoinHandle<String>>) -> String {
    let Some(h) = handle.as_mut() else {
        return String::new();
    };
    let out = h.await.unwrap_or_default();
    *handle = None;
    out
}

/// Grandchildren may keep a pipe open after the kill; don't wait on them.
async fn collect_with_grace(handle: Option<JoinHandle<String>>) -> String {
    let Some(mut h) = handle else {
        return String::new();
    };
    match timeout(OUTPUT_GRACE, &mut h).await {
        Ok(Ok(s)) => s,
        _ => {
            h.abort();
            String::new()
        }
    }
}

/// Operations handled without spawning anything
fn in_process(operation: Operation) -> bool {
    matches!(
        operation,
        Operation::Help | Operation::Clarify | Operation::ApplySnippet
    )
}

pub struct ProcessAdapter {
    tools: BTreeMap<Operation, ToolTemplate>,
    timeout: Duration,
    snippets: Arc<dyn SnippetStore>,
    snippet_include_dir: PathBuf,
}

impl ProcessAdapter {
    pub fn new(config: &NixieConfig, snippets: Arc<dyn SnippetStore>) -> Self {
        let mut tools = default_tools();
        for (name, template) in &config.tools {
            match name.parse::<Operation>() {
                Ok(op) if !in_process(op) => {
                    info!("Tool override for {}: {}", op, template.apply.join(" "));
                    tools.insert(op, template.clone());
                }
                _ => warn!("Ignoring tool override for unknown operation '{}'", name),
            }
        }
        Self {
            tools,
            timeout: Duration::from_secs(config.executor.action_timeout_secs),
            snippets,
            snippet_include_dir: config.executor.snippet_include_dir.clone(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn tool(&self, operation: Operation) -> Option<&ToolTemplate> {
        self.tools.get(&operation)
    }

    fn apply_snippet(&self, name: &str, mode: Mode) -> RawOutcome {
        let Some(text) = self.snippets.get(name) else {
            return RawOutcome::Refused(
                ExecutionError::new(
                    ErrorKind::MalformedInput,
                    format!("no snippet named '{}'", name),
                )
                .with_explanation(format!(
                    "There is no configuration snippet called '{}'.",
                    name
                )),
            );
        };
        if let Err(e) = self.snippets.validate(&text) {
            return RawOutcome::Refused(e);
        }
        let path = snippet::include_path(&self.snippet_include_dir, name);
        if mode.is_dry_run() {
            return RawOutcome::Native(Ok(format!(
                "snippet '{}' is valid, would write {}",
                name,
                path.display()
            )));
        }
        match snippet::install_snippet(&self.snippet_include_dir, name, &text) {
            Ok(path) => RawOutcome::Exited {
                code: Some(0),
                stdout: format!("wrote {}", path.display()),
                stderr: String::new(),
            },
            Err(error) => RawOutcome::SpawnFailed {
                program: format!("write {}", path.display()),
                error,
            },
        }
    }
}

#[async_trait]
impl Adapter for ProcessAdapter {
    fn backend(&self) -> Backend {
        Backend::Fallback
    }

    fn supports(&self, operation: Operation) -> bool {
        in_process(operation) || self.tools.contains_key(&operation)
    }

    fn supports_dry_run(&self, operation: Operation) -> bool {
        match operation {
            Operation::Help | Operation::Clarify | Operation::ApplySnippet => true,
            op => self.tools.get(&op).is_some_and(|t| t.dry_run.is_some()),
        }
    }

    async fn execute(&self, action: &Action, mode: Mode) -> ExecutionResult {
        let started = Instant::now();
        let outcome = match action.operation {
            Operation::Help => RawOutcome::Native(Ok(help_text().to_string())),
            Operation::Clarify => RawOutcome::Native(Ok(String::new())),
            Operation::ApplySnippet => self.apply_snippet(&action.target, mode),
            op => match self.tools.get(&op) {
                None => RawOutcome::Refused(ExecutionError::new(
                    ErrorKind::BackendUnavailable,
                    format!("no tool configured for {}", op),
                )),
                Some(template) => {
                    let argv = if mode.is_dry_run() {
                        template.dry_run.as_ref()
                    } else {
                        Some(&template.apply)
                    };
                    match argv {
                        None => RawOutcome::Refused(ExecutionError::new(
                            ErrorKind::UnsupportedDryRun,
                            format!("{} has no dry-run mode", op),
                        )),
                        Some(argv) => match render_argv(argv, &action.target) {
                            Err(e) => RawOutcome::Refused(e),
                            Ok(argv) => run_tool(&argv, self.timeout).await.outcome,
                        },
                    }
                }
            },
        };
        normalize(outcome, Backend::Fallback, started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_matches_dry_run_capability() {
        let tools = default_tools();
        for op in Operation::ALL {
            if let Some(t) = tools.get(&op) {
                assert_eq!(t.dry_run.is_some(), op.dry_run_capable(), "{}", op);
            }
        }
    }

    #[test]
    fn test_search_enables_nix_command() {
        let tools = default_tools();
        let search = &tools[&Operation::Search];
        assert_eq!(search.apply[1..3], crate::executor::NIX_FEATURE_FLAGS);
        assert_eq!(
            render_argv(&search.apply, "firefox").unwrap().last().map(String::as_str),
            Some("firefox")
        );
        assert_eq!(search.dry_run.as_ref(), Some(&search.apply));
    }

    #[test]
    fn test_render_argv() {
        let template: Vec<String> = ["nix-env", "-iA", "nixos.{target}"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            render_argv(&template, "firefox").unwrap(),
            vec!["nix-env", "-iA", "nixos.firefox"]
        );
        assert!(render_argv(&template, "--rollback").is_err());
        assert!(render_argv(&template, "firefox; rm -rf /").is_err());
    }

    #[test]
    fn test_shell_metacharacters_stay_literal() {
        let template = vec!["echo".to_string(), "{target}".to_string()];
        let argv = render_argv(&template, "$(reboot)").unwrap();
        assert_eq!(argv, vec!["echo", "$(reboot)"]);
    }

    #[tokio::test]
    async fn test_run_tool_success_and_failure() {
        let ok = run_tool(&["echo".to_string(), "hello".to_string()], Duration::from_secs(5)).await;
        match ok.outcome {
            RawOutcome::Exited { code, stdout, .. } => {
                assert_eq!(code, Some(0));
                assert_eq!(stdout.trim(), "hello");
            }
            other => panic!("unexpected {:?}", other),
        }

        let missing =
            run_tool(&["nixie-definitely-missing".to_string()], Duration::from_secs(5)).await;
        assert!(matches!(missing.outcome, RawOutcome::SpawnFailed { .. }));
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    /// Dead, or a zombie waiting for its new parent to reap it
    async fn wait_until_dead(pid: u32) -> bool {
        for _ in 0..30 {
            match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
                Err(_) => return true,
                Ok(stat) if stat.rsplit(") ").next().is_some_and(|r| r.starts_with('Z')) => {
                    return true
                }
                Ok(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
        false
    }

    #[tokio::test]
    async fn test_output_collection_bounded_by_limit() {
        let started = Instant::now();
        let out = run_tool(&sh("sleep 5 & echo hi"), Duration::from_secs(1)).await;
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
        match out.outcome {
            RawOutcome::Exited { code, stdout, .. } => {
                assert_eq!(code, Some(0));
                assert_eq!(stdout.trim(), "hi");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_whole_process_group() {
        let out = run_tool(&sh("sleep 30 & echo $!; wait"), Duration::from_millis(300)).await;
        let partial_output = match out.outcome {
            RawOutcome::TimedOut { partial_output, .. } => partial_output,
            other => panic!("expected timeout, got {:?}", other),
        };
        let background: u32 = partial_output.trim().parse().unwrap();
        assert!(wait_until_dead(background).await, "sleep {} survived", background);
    }

    #[tokio::test]
    async fn test_run_tool_timeout_kills_child() {
        let argv = ["sleep".to_string(), "30".to_string()];
        let out = run_tool(&argv, Duration::from_millis(200)).await;
        let pid = out.pid.expect("spawned");
        assert!(matches!(out.outcome, RawOutcome::TimedOut { .. }));
        assert!(!std::path::Path::new(&format!("/proc/{}", pid)).exists());
    }
}
