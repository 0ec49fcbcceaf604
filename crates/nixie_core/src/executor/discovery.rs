//! Native profile tree discovery.
//!
//! Ordered, bounded search for the directory the native library works on:
//!   1. explicit override (NIXIE_NATIVE_PATH, then config `native_path`)
//!   2. well-known install paths
//!   3. platform query (`nix eval` for the store dir, profiles live beside it)
//!   4. resources shipped with the binary (build-time dir, `<exe>/../share/nixie/profiles`)
//!
//! A candidate is accepted when it holds a `system` profile link. Finding
//! nothing is normal: the selector then uses the process adapter only.

use super::native::{NativeAdapter, ProfileLibrary};
use super::{Adapter, NativeProbe, ProgressSink, NIX_FEATURE_FLAGS};
use async_trait::async_trait;
use nixie_shared::config::NixieConfig;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const ENV_NATIVE_PATH: &str = "NIXIE_NATIVE_PATH";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySource {
    EnvOverride,
    ConfigOverride,
    WellKnown,
    PlatformQuery,
    Resource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    pub path: PathBuf,
    pub source: DiscoverySource,
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub env_override: Option<PathBuf>,
    pub config_override: Option<PathBuf>,
    pub well_known: Vec<PathBuf>,
    /// argv printing the store dir, e.g. `nix eval --raw --expr builtins.storeDir`
    pub platform_query: Option<Vec<String>>,
    pub query_timeout: Duration,
    pub resource_dirs: Vec<PathBuf>,
}

impl DiscoverySettings {
    pub fn from_config(config: &NixieConfig) -> Self {
        Self {
            env_override: std::env::var(ENV_NATIVE_PATH)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            config_override: config.executor.native_path.clone(),
            well_known: config.executor.well_known_native_paths.clone(),
            platform_query: Some(
                std::iter::once("nix")
                    .chain(NIX_FEATURE_FLAGS)
                    .chain(["eval", "--raw", "--expr", "builtins.storeDir"])
                    .map(str::to_string)
                    .collect(),
            ),
            query_timeout: Duration::from_secs(config.executor.platform_query_timeout_secs),
            resource_dirs: resource_dirs(),
        }
    }

    /// No strategy can succeed
    pub fn empty() -> Self {
        Self {
            env_override: None,
            config_override: None,
            well_known: Vec::new(),
            platform_query: None,
            query_timeout: Duration::from_secs(1),
            resource_dirs: Vec::new(),
        }
    }
}

fn resource_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = option_env!("NIXIE_NATIVE_DIR") {
        dirs.push(PathBuf::from(dir));
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(bin) = exe.parent() {
            dirs.push(bin.join("..").join("share").join("nixie").join("profiles"));
        }
    }
    dirs
}

/// A directory the profile library can work on
pub fn is_valid_location(path: &Path) -> bool {
    std::fs::symlink_metadata(path.join("system")).is_ok()
}

pub async fn discover(settings: &DiscoverySettings) -> Option<Discovered> {
    let overrides = [
        (&settings.env_override, DiscoverySource::EnvOverride),
        (&settings.config_override, DiscoverySource::ConfigOverride),
    ];
    for (path, source) in overrides {
        if let Some(path) = path {
            if is_valid_location(path) {
                return Some(found(path.clone(), source));
            }
            warn!("Native path override {} has no system profile, ignoring", path.display());
        }
    }

    if let Some(path) = settings.well_known.iter().find(|p| is_valid_location(p)) {
        return Some(found(path.clone(), DiscoverySource::WellKnown));
    }

    if let Some(argv) = &settings.platform_query {
        if let Some(path) = query_platform(argv, settings.query_timeout).await {
            if is_valid_location(&path) {
                return Some(found(path, DiscoverySource::PlatformQuery));
            }
        }
    }

    if let Some(path) = settings.resource_dirs.iter().find(|p| is_valid_location(p)) {
        return Some(found(path.clone(), DiscoverySource::Resource));
    }

    info!("Native profile tree not found, using external tools only");
    None
}

fn found(path: PathBuf, source: DiscoverySource) -> Discovered {
    info!("Native profile tree at {} ({:?})", path.display(), source);
    Discovered { path, source }
}

/// Store dir from the platform, mapped to `<store parent>/var/nix/profiles`.
async fn query_platform(argv: &[String], limit: Duration) -> Option<PathBuf> {
    let (program, args) = argv.split_first()?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let output = match timeout(limit, cmd.output()).await {
        Ok(Ok(output)) if output.status.success() => output,
        Ok(Ok(_)) => return None,
        Ok(Err(e)) => {
            debug!("Platform query {} unavailable: {}", program, e);
            return None;
        }
        Err(_) => {
            warn!("Platform query {} timed out", program);
            return None;
        }
    };

    let store_dir = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
    profiles_from_store_dir(&store_dir)
}

pub fn profiles_from_store_dir(store_dir: &Path) -> Option<PathBuf> {
    if !store_dir.is_absolute() {
        return None;
    }
    Some(store_dir.parent()?.join("var").join("nix").join("profiles"))
}

/// Discovery-backed probe building the native adapter.
pub struct DiscoveryProbe {
    settings: DiscoverySettings,
    action_timeout: Duration,
    progress: ProgressSink,
}

impl DiscoveryProbe {
    pub fn new(settings: DiscoverySettings, action_timeout: Duration) -> Self {
        Self {
            settings,
            action_timeout,
            progress: ProgressSink::default(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }
}

#[async_trait]
impl NativeProbe for DiscoveryProbe {
    async fn probe(&self) -> Option<Arc<dyn Adapter>> {
        let discovered = discover(&self.settings).await?;
        let library = Arc::new(ProfileLibrary::new(discovered.path));
        let adapter =
            NativeAdapter::new(library, self.action_timeout).with_progress(self.progress.clone());
        Some(Arc::new(adapter))
    }
}
