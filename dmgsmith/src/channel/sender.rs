use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dmgsmith_shared::errors::{BuildError, BuildResult};
use dmgsmith_shared::progress::ProgressMessage;

/// How long a send may wait for the receiver to drain a full queue.
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Writing end of the progress socket, used by the helper.
///
/// Sends block while the receiver's queue is full, so a burst of updates
/// never loses `select_phase` or `task_done`. Sends never fail the caller: a
/// message that still cannot be delivered after [`SEND_TIMEOUT`], or whose
/// receiver is gone, is logged and dropped. Call from a blocking context.
#[derive(Debug)]
pub struct ProgressSender {
    socket: UnixDatagram,
    target: PathBuf,
}

impl ProgressSender {
    pub fn connect(target: &Path) -> BuildResult<Self> {
        let socket = UnixDatagram::unbound()
            .map_err(|e| BuildError::Channel(format!("Failed to create socket: {}", e)))?;
        socket
            .set_write_timeout(Some(SEND_TIMEOUT))
            .map_err(|e| BuildError::Channel(format!("Failed to configure socket: {}", e)))?;
        Ok(Self {
            socket,
            target: target.to_path_buf(),
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn send(&self, message: &ProgressMessage) {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("{}", e);
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, &self.target) {
            tracing::error!(
                socket = %self.target.display(),
                action = message.action(),
                "Failed to send progress message: {}",
                e
            );
        }
    }

    pub fn update_progress(&self, percent: f64) {
        self.send(&ProgressMessage::UpdateProgress { percent });
    }

    pub fn update_message(&self, message: &str) {
        self.send(&ProgressMessage::UpdateMessage {
            message: message.to_string(),
        });
    }

    pub fn select_phase(&self, phase: &str) {
        self.send(&ProgressMessage::SelectPhase {
            phase: phase.to_string(),
        });
    }

    pub fn log_message(&self, log_level: u8, message: &str) {
        self.send(&ProgressMessage::LogMessage {
            log_level,
            message: message.to_string(),
        });
    }

    pub fn notify_failure(&self, message: &str) {
        self.send(&ProgressMessage::NotifyFailure {
            message: message.to_string(),
        });
    }

    pub fn notify_success(&self, message: &str) {
        self.send(&ProgressMessage::NotifySuccess {
            message: message.to_string(),
        });
    }

    pub fn task_done(&self, termination_status: i32) {
        self.send(&ProgressMessage::TaskDone { termination_status });
    }
}
