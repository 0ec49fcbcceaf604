//! nixiectl - command-line shell around the nixie pipeline.
//!
//! Everything except process setup lives here so it can be tested;
//! `main.rs` only parses arguments, sets up logging and exits with the code
//! `run` returns.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nixie_core::executor::discovery::{discover, Discovered, DiscoverySettings};
use nixie_core::learner::{erase_state_dir, LearnerHandle};
use nixie_core::{Confirmer, PipelineBuilder, ProgressSink};
use nixie_shared::config::NixieConfig;
use nixie_shared::paths;
use nixie_shared::plan::Plan;
use nixie_shared::request::{Request, Response, ResponseStatus, Verbosity};
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::debug;

/// Log filter variable (tracing EnvFilter syntax)
pub const ENV_LOG: &str = "NIXIE_LOG";

#[derive(Parser, Debug)]
#[command(name = "nixiectl")]
#[command(about = "Manage NixOS packages and configuration in plain language", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Config file (default: ~/.config/nixie/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log what nixie is doing to stderr
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Ask nixie to do something, e.g. `nixiectl ask install firefox`
    Ask {
        #[arg(required = true)]
        text: Vec<String>,

        /// Show what would happen without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Go ahead without asking for confirmation
        #[arg(long, short)]
        yes: bool,

        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show everything nixie has learned about your usage
    Learned,

    /// Delete everything nixie has learned
    Forget,

    /// Show which backend and settings are in use
    Doctor,
}

pub fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env(ENV_LOG)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Run a parsed command; returns the process exit code.
pub async fn run(cli: Cli) -> Result<i32> {
    let config = NixieConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Ask {
            text,
            dry_run,
            yes,
            json,
        } => ask(config, text.join(" "), dry_run, yes, json, cli.verbose).await,
        Command::Learned => {
            let learner = LearnerHandle::spawn(&config.learner, &config.state_dir());
            println!("{}", learner.export_text().await?);
            Ok(0)
        }
        Command::Forget => {
            let learner = LearnerHandle::spawn(&config.learner, &config.state_dir());
            if learner.is_enabled() {
                learner.erase().await?;
            } else {
                erase_state_dir(&config.state_dir())
                    .context("Failed to delete learned data")?;
            }
            println!("All learned data has been deleted.");
            Ok(0)
        }
        Command::Doctor => {
            let discovered = if config.executor.force_fallback {
                None
            } else {
                discover(&DiscoverySettings::from_config(&config)).await
            };
            let config_file = cli.config.clone().or_else(paths::config_file);
            for line in doctor_report(&config, config_file.as_deref(), discovered.as_ref()) {
                println!("{}", line);
            }
            Ok(0)
        }
    }
}

async fn ask(
    config: NixieConfig,
    text: String,
    dry_run: bool,
    yes: bool,
    json: bool,
    verbose: bool,
) -> Result<i32> {
    let mut builder = PipelineBuilder::new(config).confirmer(Box::new(StdinConfirmer));
    if verbose {
        let (tx, mut rx) = mpsc::unbounded_channel();
        builder = builder.progress(ProgressSink::new(tx));
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event.fraction {
                    Some(f) => eprintln!(
                        "[{:>3.0}%] {}: {}",
                        f * 100.0,
                        event.operation,
                        event.message
                    ),
                    None => eprintln!("[....] {}: {}", event.operation, event.message),
                }
            }
        });
    }
    let mut pipeline = builder.build()?;

    let request = if dry_run {
        Request::dry_run(text)
    } else {
        Request::apply(text)
    }
    .non_interactive(yes);

    let response = pipeline.handle(request).await?;
    // the process exits right after, so wait for the learner to save
    if let Err(e) = pipeline.learner().flush().await {
        debug!("Learner flush failed: {}", e);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print!("{}", render(&response));
    }
    Ok(response.exit_code())
}

/// Human-readable response; detail shrinks as the user gets more familiar.
pub fn render(response: &Response) -> String {
    let mut out = String::new();
    let verbosity = response.verbosity;

    // a blocked plan always shows what would have run
    let show_plan = verbosity != Verbosity::Concise
        || response.status == ResponseStatus::ConfirmationRequired;
    if show_plan && response.status != ResponseStatus::ClarificationNeeded {
        for line in &response.plan_summary {
            out.push_str(&format!("  {}\n", line));
        }
    }

    if let Some(result) = &response.result {
        let output = result.output.trim();
        if !output.is_empty() {
            out.push_str(output);
            out.push('\n');
        }
    }

    out.push_str(&response.message);
    out.push('\n');

    if verbosity == Verbosity::Detailed {
        if let Some(error) = response.result.as_ref().and_then(|r| r.error.as_ref()) {
            out.push_str(&format!("  ({}: {})\n", error.kind, error.detail));
        }
    }

    for suggestion in &response.suggestions {
        out.push_str(&format!("-> {}\n", suggestion));
    }
    out
}

pub fn doctor_report(
    config: &NixieConfig,
    config_file: Option<&Path>,
    discovered: Option<&Discovered>,
) -> Vec<String> {
    let config_file = match config_file {
        Some(p) if p.exists() => p.display().to_string(),
        Some(p) => format!("{} (not present, using defaults)", p.display()),
        None => "(none)".to_string(),
    };
    let native = if config.executor.force_fallback {
        "disabled (forced fallback)".to_string()
    } else {
        match discovered {
            Some(d) => format!("{} ({:?})", d.path.display(), d.source),
            None => "not found, external tools only".to_string(),
        }
    };

    vec![
        format!("nixie {}", nixie_shared::VERSION),
        format!("Config file:      {}", config_file),
        format!("State directory:  {}", config.state_dir().display()),
        format!("Native backend:   {}", native),
        format!("Action timeout:   {}s", config.executor.action_timeout_secs),
        format!("Min confidence:   {}", config.recognizer.min_confidence),
        format!(
            "Learning:         {}",
            if config.learner.enabled { "on" } else { "off" }
        ),
        format!("Snippet includes: {}", config.executor.snippet_include_dir.display()),
    ]
}

/// Asks on the terminal. Without a terminal nothing is ever confirmed.
pub struct StdinConfirmer;

impl Confirmer for StdinConfirmer {
    fn confirm(&self, plan: &Plan) -> bool {
        if !std::io::stdin().is_terminal() {
            return false;
        }
        let mut stderr = std::io::stderr();
        let _ = writeln!(stderr, "This will run:");
        for line in plan.summary() {
            let _ = writeln!(stderr, "  {}", line);
        }
        let _ = write!(stderr, "Go ahead? [y/N] ");
        let _ = stderr.flush();

        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        is_yes(&answer)
    }
}

pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}
