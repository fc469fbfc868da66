//! Build events delivered to the caller.

use std::path::Path;

/// Receives every event of a build, one method per event kind.
///
/// Calls come from the scheduler's own task, never concurrently for the
/// same build.
pub trait BuildObserver: Send + Sync {
    fn build_starting(&self, output: &Path);

    /// Sum of all phase weights. Sent once, before any work starts.
    fn set_total_weight(&self, total: u64);

    fn set_phase(&self, phase: &str);

    /// Overall progress in weight units, between 0 and the total weight.
    fn set_progress(&self, progress: f64);

    fn set_progress_message(&self, message: &str);

    fn build_succeeded(&self);

    fn build_failed(&self, message: &str, details: &str);

    /// Teardown finished. Sent exactly once per build.
    fn build_stopped(&self);

    fn detach_failed(&self, image: &Path, message: &str) {
        tracing::warn!(image = %image.display(), "Failed to detach: {}", message);
    }
}
