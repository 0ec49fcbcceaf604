//! Per-user file locations.
//!
//! Each lookup follows the same chain: explicit env override, then the XDG
//! directory, then a `$HOME` fallback.

use std::path::PathBuf;

pub const ENV_CONFIG: &str = "NIXIE_CONFIG";
pub const ENV_STATE_DIR: &str = "NIXIE_STATE_DIR";

/// Config file location
///
/// Priority:
/// 1. $NIXIE_CONFIG
/// 2. $XDG_CONFIG_HOME/nixie/config.toml
/// 3. ~/.config/nixie/config.toml
pub fn config_file() -> Option<PathBuf> {
    if let Some(path) = non_empty_env(ENV_CONFIG) {
        return Some(PathBuf::from(path));
    }
    if let Some(dir) = dirs::config_dir() {
        return Some(dir.join("nixie").join("config.toml"));
    }
    dirs::home_dir().map(|home| home.join(".config").join("nixie").join("config.toml"))
}

/// Learner state directory (preferences + history)
///
/// Priority:
/// 1. $NIXIE_STATE_DIR
/// 2. $XDG_STATE_HOME/nixie
/// 3. ~/.local/state/nixie
/// 4. ./.nixie (no home directory at all)
pub fn state_dir() -> PathBuf {
    if let Some(path) = non_empty_env(ENV_STATE_DIR) {
        return PathBuf::from(path);
    }
    if let Some(dir) = dirs::state_dir() {
        return dir.join("nixie");
    }
    match dirs::home_dir() {
        Some(home) => home.join(".local").join("state").join("nixie"),
        None => PathBuf::from(".nixie"),
    }
}

/// Where generated configuration snippets are kept before being applied
pub fn snippet_dir() -> PathBuf {
    match dirs::config_dir() {
        Some(dir) => dir.join("nixie").join("snippets"),
        None => state_dir().join("snippets"),
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
