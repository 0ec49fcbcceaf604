//! Execution results and the closed error taxonomy.
//!
//! Both backends report through these types, so a caller cannot tell them
//! apart beyond `backend_used`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Native,
    Fallback,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Native => "native",
            Backend::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// ErrorKind
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PackageNotFound,
    PermissionDenied,
    Timeout,
    UnsupportedDryRun,
    /// Concurrent modification, store lock held, file collision
    ConflictingState,
    /// Neither backend could run the action
    BackendUnavailable,
    MalformedInput,
    /// Catch-all; every occurrence is logged so the table can grow
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 8] = [
        Self::PackageNotFound,
        Self::PermissionDenied,
        Self::Timeout,
        Self::UnsupportedDryRun,
        Self::ConflictingState,
        Self::BackendUnavailable,
        Self::MalformedInput,
        Self::Unknown,
    ];

    /// Machine-readable kind
    pub fn code(&self) -> &'static str {
        match self {
            Self::PackageNotFound => "package_not_found",
            Self::PermissionDenied => "permission_denied",
            Self::Timeout => "timeout",
            Self::UnsupportedDryRun => "unsupported_dry_run",
            Self::ConflictingState => "conflicting_state",
            Self::BackendUnavailable => "backend_unavailable",
            Self::MalformedInput => "malformed_input",
            Self::Unknown => "unknown",
        }
    }

    /// Default user-facing explanation
    pub fn explanation(&self) -> &'static str {
        match self {
            Self::PackageNotFound => {
                "That package isn't in the package set. Try searching for it first."
            }
            Self::PermissionDenied => {
                "This change needs administrator rights. Run it again with sudo."
            }
            Self::Timeout => "The operation took too long and was stopped.",
            Self::UnsupportedDryRun => {
                "This operation can't be previewed, so nothing was run. Use apply mode to run it."
            }
            Self::ConflictingState => {
                "Another operation is changing the system right now, or files conflict. Wait and try again."
            }
            Self::BackendUnavailable => "No way to run this operation was found on this machine.",
            Self::MalformedInput => "The request or configuration couldn't be understood.",
            Self::Unknown => "Something went wrong. The details below may help.",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// An ErrorKind plus its developer detail and user explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub detail: String,
    pub explanation: String,
}

/// Longest target prefix kept in an error signature
pub const SIGNATURE_TARGET_CHARS: usize = 50;

impl ExecutionError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            kind,
            detail: if detail.trim().is_empty() {
                kind.code().to_string()
            } else {
                detail
            },
            explanation: kind.explanation().to_string(),
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        let explanation = explanation.into();
        if !explanation.trim().is_empty() {
            self.explanation = explanation;
        }
        self
    }

    /// Key the learner uses to match a recurring failure of the same
    /// operation on the same target
    pub fn signature(&self, operation: &str, target: &str) -> String {
        let target: String = target
            .trim()
            .to_lowercase()
            .chars()
            .take(SIGNATURE_TARGET_CHARS)
            .collect();
        if target.is_empty() {
            format!("{}:{}", self.kind.code(), operation)
        } else {
            format!("{}:{}:{}", self.kind.code(), operation, target)
        }
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.explanation)
    }
}

// =============================================================================
// ExecutionResult
// =============================================================================

/// Outcome of running a plan (or one action of it).
///
/// Fields are public for serialization, but results should be built with
/// `ok`/`failed` so `success == error.is_none()` always holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<ExecutionError>,
    /// Seconds
    pub duration: f64,
    pub backend_used: Backend,
    /// Actions that ran to completion
    #[serde(default)]
    pub completed_actions: usize,
    /// Set when an action was cut short (timeout); nothing was rolled back
    #[serde(default)]
    pub incomplete: bool,
    /// Set when a generation from before the change is available to switch back to
    #[serde(default)]
    pub snapshot_available: bool,
}

impl ExecutionResult {
    pub fn ok(output: impl Into<String>, duration: f64, backend_used: Backend) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            duration,
            backend_used,
            completed_actions: 1,
            incomplete: false,
            snapshot_available: false,
        }
    }

    pub fn failed(
        error: ExecutionError,
        output: impl Into<String>,
        duration: f64,
        backend_used: Backend,
    ) -> Self {
        let incomplete = error.kind == ErrorKind::Timeout;
        Self {
            success: false,
            output: output.into(),
            error: Some(error),
            duration,
            backend_used,
            completed_actions: 0,
            incomplete,
            snapshot_available: false,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// `success == false` exactly when an error is present, and the error is explained.
    pub fn is_consistent(&self) -> bool {
        match &self.error {
            None => self.success,
            Some(e) => !self.success && !e.explanation.trim().is_empty() && !e.detail.is_empty(),
        }
    }
}
