//! Error types for nixie.
//!
//! `NixieError` covers hard failures of the pipeline itself (bad config,
//! unreadable state, structurally malformed input). Execution failures are
//! not errors in this sense: they travel inside `ExecutionResult` as an
//! `ErrorKind` (see `result.rs`).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NixieError {
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid pattern: {0}")]
    Pattern(String),

    #[error("Learner unavailable: {0}")]
    LearnerClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NixieError {
    /// Stable machine-readable code, used in JSON output and logs.
    pub fn code(&self) -> &'static str {
        match self {
            NixieError::MalformedInput(_) => "malformed_input",
            NixieError::Config(_) => "config",
            NixieError::Pattern(_) => "pattern",
            NixieError::LearnerClosed(_) => "learner_closed",
            NixieError::Io(_) => "io",
            NixieError::Json(_) => "json",
            NixieError::Toml(_) => "toml",
            NixieError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, NixieError>;
