//! dmgsmith shared code
//!
//! Types used by both the scheduler side (`dmgsmith`) and the helper side of
//! the progress socket, plus the error taxonomy every crate returns.

pub mod constants;
pub mod errors;
pub mod progress;

pub use errors::{BuildError, BuildResult};
pub use progress::{MAX_MSG_SIZE, ProgressMessage};
