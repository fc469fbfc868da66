//! Error taxonomy shared by the build pipeline, the helper and the CLI.

use thiserror::Error;

/// Result alias used across all dmgsmith crates.
pub type BuildResult<T> = Result<T, BuildError>;

/// Errors produced by the build pipeline.
///
/// The first group of variants maps one-to-one onto the failure kinds the
/// scheduler distinguishes; the rest carry supporting context.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Attaching a disk image failed. Never retried.
    #[error("{0}")]
    Mount(String),

    /// Detaching a disk image failed on every attempt. Carries the text of the
    /// last attempt.
    #[error("{0}")]
    Unmount(String),

    /// A downloaded payload did not hash to the expected value.
    #[error("Expected sha1 checksum {expected} but got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Network transfer failed.
    #[error("{0}")]
    Download(String),

    /// The task/phase bookkeeping is inconsistent. A programming error.
    #[error("{0}")]
    Scheduler(String),

    /// The helper reported an unexpected nonzero exit status.
    #[error("Task exited with status {status}")]
    Helper { status: i32 },

    /// The user dismissed the elevation prompt.
    #[error("The authorization was cancelled by the user.")]
    Cancelled,

    /// Cache or scratch storage failure.
    #[error("storage: {0}")]
    Storage(String),

    /// Invalid input or configuration.
    #[error("{0}")]
    Config(String),

    /// Progress socket failure.
    #[error("channel: {0}")]
    Channel(String),

    /// Subprocess could not be launched or exited abnormally.
    #[error("{0}")]
    Process(String),

    /// Template could not be loaded.
    #[error("template: {0}")]
    Template(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// True for the clean-stop outcome of a dismissed elevation prompt.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BuildError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_mismatch_message() {
        let err = BuildError::ChecksumMismatch {
            expected: "aaaa".into(),
            actual: "bbbb".into(),
        };
        assert_eq!(err.to_string(), "Expected sha1 checksum aaaa but got bbbb");
    }

    #[test]
    fn helper_status_message() {
        assert_eq!(
            BuildError::Helper { status: 7 }.to_string(),
            "Task exited with status 7"
        );
    }

    #[test]
    fn only_cancelled_is_cancelled() {
        assert!(BuildError::Cancelled.is_cancelled());
        assert!(!BuildError::Mount("x".into()).is_cancelled());
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: BuildError = io.into();
        assert!(matches!(err, BuildError::Io(_)));
    }
}
