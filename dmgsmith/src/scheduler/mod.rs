//! Build scheduling.
//!
//! ## Architecture
//!
//! A build is four tasks run in order, each made of weighted phases:
//!
//! ```text
//! Prepare ──→ Install ──→ [Finalize] ──→ Finish
//!  attach      helper       helper
//!  + size      (elevated)   imagescan
//! ```
//!
//! Slow work (attaching, sizing, running the helper) happens on worker
//! tasks. Their results, and every message the helper posts to the progress
//! socket, are funnelled back to the one task that owns the build state.
//! Teardown runs exactly once per build, whatever the outcome.

mod engine;
mod observer;
mod plan;
mod prepare;

pub use engine::{BuildHandle, BuildOutcome, BuildRequest, BuildScheduler, BuildServices};
pub use observer::BuildObserver;
pub use plan::{
    BuildStatus, Inconsistency, Phase, PlanInputs, Schedule, Task, TaskKind, build_tasks,
};

/// A terminal build failure as shown to the user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Failure {
    pub message: String,
    pub details: String,
}

impl Failure {
    pub(crate) fn new(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: details.into(),
        }
    }
}

impl From<Inconsistency> for Failure {
    fn from(e: Inconsistency) -> Self {
        Self::new(e.message, e.details)
    }
}
