//! Package index lookup used by the planner to check package names.
//!
//! The index is read-only. `NixSearchIndex` asks `nix search --json`;
//! `StaticIndex` serves a fixed list (tests, offline use).

use crate::executor::NIX_FEATURE_FLAGS;
use async_trait::async_trait;
use nixie_shared::error::{NixieError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageCandidate {
    /// Attribute name, what `nix-env -iA nixos.<attr>` takes
    pub attr: String,
    pub version: String,
    pub description: String,
}

impl PackageCandidate {
    pub fn new(attr: &str, version: &str, description: &str) -> Self {
        Self {
            attr: attr.to_string(),
            version: version.to_string(),
            description: description.to_string(),
        }
    }
}

#[async_trait]
pub trait PackageIndex: Send + Sync {
    async fn search(&self, fragment: &str) -> Result<Vec<PackageCandidate>>;
}

// =============================================================================
// nix search
// =============================================================================

#[derive(Debug, Deserialize)]
struct SearchEntry {
    #[serde(default)]
    version: String,
    #[serde(default)]
    description: String,
}

pub struct NixSearchIndex {
    program: String,
    timeout: Duration,
}

impl NixSearchIndex {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: "nix".to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl PackageIndex for NixSearchIndex {
    async fn search(&self, fragment: &str) -> Result<Vec<PackageCandidate>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(search_args(fragment)?)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(NixieError::Io(e)),
            Err(_) => {
                warn!("Package lookup for '{}' timed out", fragment);
                return Err(NixieError::Internal("package lookup timed out".to_string()));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NixieError::Internal(format!(
                "nix search failed: {}",
                stderr.trim()
            )));
        }

        let candidates = parse_search_json(&String::from_utf8_lossy(&output.stdout))?;
        debug!("nix search '{}': {} candidates", fragment, candidates.len());
        Ok(candidates)
    }
}

/// Arguments for a `nix search` over nixpkgs matching names that start
/// with `fragment`.
pub fn search_args(fragment: &str) -> Result<Vec<String>> {
    if fragment.starts_with('-')
        || fragment.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(NixieError::MalformedInput(format!(
            "not a package name: {:?}",
            fragment
        )));
    }
    let mut args: Vec<String> = NIX_FEATURE_FLAGS.iter().map(|s| s.to_string()).collect();
    args.extend(["search", "nixpkgs", "--json"].map(String::from));
    args.push(format!("^{}", regex::escape(fragment)));
    Ok(args)
}

/// Parse `nix search --json` output. Keys look like
/// `legacyPackages.x86_64-linux.firefox`; the attr is the part after the system.
pub fn parse_search_json(json: &str) -> Result<Vec<PackageCandidate>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: BTreeMap<String, SearchEntry> = serde_json::from_str(json)?;
    Ok(entries
        .into_iter()
        .map(|(key, entry)| {
            let attr = key.splitn(3, '.').nth(2).unwrap_or(&key).to_string();
            PackageCandidate {
                attr,
                version: entry.version,
                description: entry.description,
            }
        })
        .collect())
}

// =============================================================================
// Static
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct StaticIndex {
    packages: Vec<PackageCandidate>,
}

impl StaticIndex {
    pub fn new(packages: Vec<PackageCandidate>) -> Self {
        Self { packages }
    }

    pub fn from_names(names: &[&str]) -> Self {
        Self::new(
            names
                .iter()
                .map(|n| PackageCandidate::new(n, "", ""))
                .collect(),
        )
    }
}

#[async_trait]
impl PackageIndex for StaticIndex {
    async fn search(&self, fragment: &str) -> Result<Vec<PackageCandidate>> {
        Ok(self
            .packages
            .iter()
            .filter(|p| p.attr.contains(fragment))
            .cloned()
            .collect())
    }
}
