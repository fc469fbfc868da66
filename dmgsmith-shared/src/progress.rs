//! Progress protocol spoken between the helper process and the scheduler.
//!
//! Every message is one binary property list dictionary carried in exactly
//! one datagram. The `action` key selects the variant; the remaining keys are
//! the variant's payload:
//!
//! ```text
//! { action: "update_progress", percent: 42.0 }
//! { action: "task_done", termination_status: 0 }
//! ```

use serde::{Deserialize, Serialize};

use crate::errors::{BuildError, BuildResult};

/// Upper bound on an encoded message, and the receive buffer size.
pub const MAX_MSG_SIZE: usize = 32768;

/// A single status update from the helper.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ProgressMessage {
    /// Progress through the current phase, 0 to 100.
    UpdateProgress { percent: f64 },
    /// Human readable status line.
    UpdateMessage { message: String },
    /// Advance to the next phase. `phase` is informational.
    SelectPhase { phase: String },
    /// Forward a log line at a syslog severity (0 emergency .. 7 debug).
    LogMessage { log_level: u8, message: String },
    /// The helper has failed; the build must stop with `message`.
    NotifyFailure { message: String },
    NotifySuccess { message: String },
    /// The wrapped program exited.
    TaskDone { termination_status: i32 },
    /// Any action this build does not know about.
    #[serde(other, skip_serializing)]
    Unknown,
}

impl ProgressMessage {
    /// Action name as it appears on the wire.
    pub fn action(&self) -> &'static str {
        match self {
            ProgressMessage::UpdateProgress { .. } => "update_progress",
            ProgressMessage::UpdateMessage { .. } => "update_message",
            ProgressMessage::SelectPhase { .. } => "select_phase",
            ProgressMessage::LogMessage { .. } => "log_message",
            ProgressMessage::NotifyFailure { .. } => "notify_failure",
            ProgressMessage::NotifySuccess { .. } => "notify_success",
            ProgressMessage::TaskDone { .. } => "task_done",
            ProgressMessage::Unknown => "unknown",
        }
    }

    /// Encode as a binary property list, refusing anything that would not fit
    /// in a single datagram.
    pub fn encode(&self) -> BuildResult<Vec<u8>> {
        let mut buf = Vec::new();
        plist::to_writer_binary(&mut buf, self).map_err(|e| {
            BuildError::Channel(format!("Failed to encode {} message: {}", self.action(), e))
        })?;
        if buf.len() > MAX_MSG_SIZE {
            return Err(BuildError::Channel(format!(
                "Encoded {} message is {} bytes, limit is {}",
                self.action(),
                buf.len(),
                MAX_MSG_SIZE
            )));
        }
        Ok(buf)
    }

    /// Decode one datagram. Accepts binary and XML property lists.
    pub fn decode(datagram: &[u8]) -> BuildResult<Self> {
        plist::from_bytes(datagram)
            .map_err(|e| BuildError::Channel(format!("Failed to decode progress message: {}", e)))
    }
}
