//! Shared types for nixie: the request/response model, the execution error
//! taxonomy, configuration and the learner's on-disk state.

pub mod config;
pub mod error;
pub mod history;
pub mod intent;
pub mod paths;
pub mod plan;
pub mod preferences;
pub mod request;
pub mod result;

pub use config::NixieConfig;
pub use error::{NixieError, Result};
pub use intent::{Intent, IntentAction};
pub use plan::{Action, Operation, Plan, RollbackStrategy, Safety};
pub use preferences::LearnedPreferences;
pub use request::{Mode, Request, Response, ResponseStatus, Verbosity};
pub use result::{Backend, ErrorKind, ExecutionError, ExecutionResult};

/// Version string for user-facing output
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
