use std::path::{Path, PathBuf};

use dmgsmith_shared::errors::{BuildError, BuildResult};
use dmgsmith_shared::progress::{MAX_MSG_SIZE, ProgressMessage};
use tokio::net::UnixDatagram;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Receiving end of the progress socket.
///
/// Bound at a fresh path inside a scratch directory. A background task reads
/// one datagram at a time, decodes it and forwards it to the owner's queue,
/// so messages are handled on the owner's task and never concurrently with
/// its other state changes.
#[derive(Debug)]
pub struct ProgressChannel {
    path: PathBuf,
    cancel: CancellationToken,
    receiver: Option<JoinHandle<()>>,
}

impl ProgressChannel {
    /// Bind `<scratch_dir>/progress.<random>.sock` and start receiving.
    ///
    /// Socket paths are limited to about 104 bytes, so keep `scratch_dir` short.
    pub fn listen(scratch_dir: &Path, sink: mpsc::Sender<ProgressMessage>) -> BuildResult<Self> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let path = scratch_dir.join(format!("progress.{}.sock", &id[..8]));
        let socket = UnixDatagram::bind(&path).map_err(|e| {
            BuildError::Channel(format!("Failed to bind {}: {}", path.display(), e))
        })?;
        tracing::debug!(socket = %path.display(), "Listening for progress messages");

        let cancel = CancellationToken::new();
        let receiver = tokio::spawn(receive_loop(socket, sink, cancel.clone()));

        Ok(Self {
            path,
            cancel,
            receiver: Some(receiver),
        })
    }

    /// Socket path handed to the helper with `--socket`.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop receiving and remove the socket file.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(receiver) = self.receiver.take() {
            let _ = receiver.await;
        }
        self.remove_socket();
    }

    fn remove_socket(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(socket = %self.path.display(), "Removed progress socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(socket = %self.path.display(), "Failed to remove socket: {}", e),
        }
    }
}

impl Drop for ProgressChannel {
    fn drop(&mut self) {
        if self.receiver.is_some() {
            self.cancel.cancel();
            self.remove_socket();
        }
    }
}

async fn receive_loop(
    socket: UnixDatagram,
    sink: mpsc::Sender<ProgressMessage>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_MSG_SIZE];
    loop {
        let len = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv(&mut buf) => match received {
                Ok(len) => len,
                Err(e) => {
                    tracing::error!("Progress socket receive failed: {}", e);
                    break;
                }
            },
        };

        match ProgressMessage::decode(&buf[..len]) {
            Ok(message) => {
                tracing::trace!(action = message.action(), "Progress message");
                if sink.send(message).await.is_err() {
                    tracing::debug!("Progress consumer gone, stopping receiver");
                    break;
                }
            }
            Err(e) => tracing::warn!("Dropping {} byte datagram: {}", len, e),
        }
    }
}
