//! nixie core: turns a plain-language request into a checked plan and runs
//! it on this NixOS machine.
//!
//! Flow per request:
//!   recognizer -> planner -> confirmation gate -> selector (native | process)
//!   -> normalizer -> Response, with the learner observing in the background.

pub mod executor;
pub mod learner;
pub mod package_index;
pub mod pipeline;
pub mod planner;
pub mod recognizer;
pub mod session;
pub mod snippet;

pub use executor::{Adapter, NativeProbe, ProgressEvent, ProgressSink, Selector};
pub use learner::{LearnerHandle, Observation};
pub use pipeline::{Confirmer, Pipeline, PipelineBuilder};
pub use planner::Planner;
pub use recognizer::Recognizer;
pub use session::Session;
