//! Configuration for nixie.
//!
//! Loads `config.toml` from the per-user config dir (see `paths`) or uses
//! defaults. Every field has a default so partial files are fine. A missing
//! file is normal; a file that fails to parse is an error.

use crate::error::{NixieError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const ENV_FORCE_FALLBACK: &str = "NIXIE_FORCE_FALLBACK";
pub const ENV_NO_LEARNING: &str = "NIXIE_NO_LEARNING";

/// Default location of the system profile tree
pub const DEFAULT_PROFILES_DIR: &str = "/nix/var/nix/profiles";

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizerConfig {
    /// Below this, the intent is unknown and the planner asks for clarification
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

fn default_min_confidence() -> f64 {
    0.5
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Check install targets against the package index
    #[serde(default = "default_true")]
    pub verify_packages: bool,

    /// Whether state changes create generations. Unset means detect from the
    /// profiles directory.
    #[serde(default)]
    pub atomic_generations: Option<bool>,

    /// Source directory of named configuration snippets
    #[serde(default)]
    pub snippet_dir: Option<PathBuf>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            verify_packages: true,
            atomic_generations: None,
            snippet_dir: None,
        }
    }
}

impl PlannerConfig {
    pub fn snippet_dir(&self) -> PathBuf {
        self.snippet_dir.clone().unwrap_or_else(paths::snippet_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Per-action timeout
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,

    /// Skip native discovery and run everything through external tools
    #[serde(default)]
    pub force_fallback: bool,

    /// Native profile tree location (the NIXIE_NATIVE_PATH env var wins)
    #[serde(default)]
    pub native_path: Option<PathBuf>,

    #[serde(default = "default_well_known_paths")]
    pub well_known_native_paths: Vec<PathBuf>,

    /// Timeout for the platform query used during discovery
    #[serde(default = "default_platform_query_timeout")]
    pub platform_query_timeout_secs: u64,

    /// Where applied snippets are written for the system configuration to import
    #[serde(default = "default_snippet_include_dir")]
    pub snippet_include_dir: PathBuf,
}

fn default_action_timeout() -> u64 {
    30
}

fn default_well_known_paths() -> Vec<PathBuf> {
    vec![PathBuf::from(DEFAULT_PROFILES_DIR)]
}

fn default_platform_query_timeout() -> u64 {
    5
}

fn default_snippet_include_dir() -> PathBuf {
    PathBuf::from("/etc/nixos/nixie.d")
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            action_timeout_secs: default_action_timeout(),
            force_fallback: false,
            native_path: None,
            well_known_native_paths: default_well_known_paths(),
            platform_query_timeout_secs: default_platform_query_timeout(),
            snippet_include_dir: default_snippet_include_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Save preferences after this many observations
    #[serde(default = "default_persist_every")]
    pub persist_every: u32,

    /// Independent corrections needed before an alias is used
    #[serde(default = "default_alias_threshold")]
    pub alias_threshold: u32,

    /// Times a command pair must be seen before it is suggested
    #[serde(default = "default_sequence_threshold")]
    pub sequence_threshold: u32,

    #[serde(default = "default_history_max_entries")]
    pub history_max_entries: usize,
}

fn default_persist_every() -> u32 {
    10
}

fn default_alias_threshold() -> u32 {
    3
}

fn default_sequence_threshold() -> u32 {
    2
}

fn default_history_max_entries() -> usize {
    crate::history::DEFAULT_MAX_ENTRIES
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            persist_every: default_persist_every(),
            alias_threshold: default_alias_threshold(),
            sequence_threshold: default_sequence_threshold(),
            history_max_entries: default_history_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Recent requests kept in memory
    #[serde(default = "default_window")]
    pub window: usize,
}

fn default_window() -> usize {
    10
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Learner state directory override
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

/// argv template for one operation. `{target}` is replaced inside a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolTemplate {
    pub apply: Vec<String>,
    /// None when the tool cannot preview this operation
    #[serde(default)]
    pub dry_run: Option<Vec<String>>,
}

impl ToolTemplate {
    pub fn new(apply: &[&str], dry_run: Option<&[&str]>) -> Self {
        Self {
            apply: apply.iter().map(|s| s.to_string()).collect(),
            dry_run: dry_run.map(|d| d.iter().map(|s| s.to_string()).collect()),
        }
    }
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Root
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NixieConfig {
    #[serde(default)]
    pub recognizer: RecognizerConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub learner: LearnerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    /// Per-operation overrides of the built-in tool table, keyed by operation name
    #[serde(default)]
    pub tools: BTreeMap<String, ToolTemplate>,
}

impl NixieConfig {
    /// Load from an explicit path, or the default location, then apply env overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit.map(Path::to_path_buf).or_else(paths::config_file);

        let mut config = match path {
            Some(p) if p.exists() => {
                let config = Self::from_file(&p)?;
                info!("Loaded config from {}", p.display());
                config
            }
            Some(p) if explicit.is_some() => {
                return Err(NixieError::Config(format!(
                    "config file {} does not exist",
                    p.display()
                )));
            }
            _ => {
                debug!("No config file, using defaults");
                Self::default()
            }
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup` (std::env::var in production).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if lookup(ENV_FORCE_FALLBACK).is_some_and(|v| is_truthy(&v)) {
            info!("{} set, native backend disabled", ENV_FORCE_FALLBACK);
            self.executor.force_fallback = true;
        }
        if lookup(ENV_NO_LEARNING).is_some_and(|v| is_truthy(&v)) {
            info!("{} set, learner disabled", ENV_NO_LEARNING);
            self.learner.enabled = false;
        }
        if let Some(dir) = lookup(paths::ENV_STATE_DIR).filter(|v| !v.trim().is_empty()) {
            self.paths.state_dir = Some(PathBuf::from(dir));
        }
    }

    fn validate(&self) -> Result<()> {
        let c = self.recognizer.min_confidence;
        if !(0.0..=1.0).contains(&c) {
            return Err(NixieError::Config(format!(
                "recognizer.min_confidence must be within [0, 1], got {}",
                c
            )));
        }
        if self.executor.action_timeout_secs == 0 {
            return Err(NixieError::Config(
                "executor.action_timeout_secs must be positive".to_string(),
            ));
        }
        for (name, template) in &self.tools {
            if template.apply.is_empty() {
                return Err(NixieError::Config(format!("tools.{}.apply is empty", name)));
            }
        }
        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        self.paths.state_dir.clone().unwrap_or_else(paths::state_dir)
    }

    /// Configured value, or whether the system profile exists
    pub fn atomic_generations(&self) -> bool {
        self.planner.atomic_generations.unwrap_or_else(|| {
            Path::new(DEFAULT_PROFILES_DIR).join("system").exists()
        })
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
