//! Caller interface: what a shell sends in and gets back.

use crate::intent::Intent;
use crate::result::{ErrorKind, ExecutionResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    DryRun,
    Apply,
}

impl Mode {
    pub fn is_dry_run(&self) -> bool {
        matches!(self, Mode::DryRun)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub text: String,
    pub mode: Mode,
    /// Caller-supplied override standing in for interactive confirmation
    #[serde(default)]
    pub non_interactive: bool,
}

impl Request {
    pub fn apply(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            mode: Mode::Apply,
            non_interactive: false,
        }
    }

    pub fn dry_run(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            mode: Mode::DryRun,
            non_interactive: false,
        }
    }

    pub fn non_interactive(mut self, yes: bool) -> Self {
        self.non_interactive = yes;
        self
    }
}

/// How much explanation the user wants, derived from how often they use nixie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    #[default]
    Detailed,
    Normal,
    Concise,
}

impl Verbosity {
    pub fn from_command_count(total: u64) -> Self {
        match total {
            0..=9 => Verbosity::Detailed,
            10..=49 => Verbosity::Normal,
            _ => Verbosity::Concise,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verbosity::Detailed => "detailed",
            Verbosity::Normal => "normal",
            Verbosity::Concise => "concise",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Completed,
    ClarificationNeeded,
    /// Destructive or confirm-required plan with no confirmation given
    ConfirmationRequired,
    BackendFailure,
    TimedOut,
}

impl ResponseStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            ResponseStatus::Completed => 0,
            ResponseStatus::ClarificationNeeded => 2,
            ResponseStatus::ConfirmationRequired => 3,
            ResponseStatus::BackendFailure => 4,
            ResponseStatus::TimedOut => 5,
        }
    }

    /// Status for a plan that actually ran
    pub fn from_result(result: &ExecutionResult) -> Self {
        match result.error_kind() {
            None => ResponseStatus::Completed,
            Some(ErrorKind::Timeout) => ResponseStatus::TimedOut,
            Some(_) => ResponseStatus::BackendFailure,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub request_id: Uuid,
    pub intent: Intent,
    pub plan_summary: Vec<String>,
    pub status: ResponseStatus,
    /// Present whenever execution was attempted
    pub result: Option<ExecutionResult>,
    pub suggestions: Vec<String>,
    /// One-line message for the user
    pub message: String,
    pub verbosity: Verbosity,
}

impl Response {
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}
