//! Out-of-process progress channel.
//!
//! The helper runs in its own (often elevated) process tree, so it reports
//! back over a local datagram socket rather than a pipe. One datagram carries
//! one [`ProgressMessage`]; anything that does not decode is dropped.

mod listener;
mod sender;

pub use listener::ProgressChannel;
pub use sender::ProgressSender;

/// Re-emit a helper log line at the tracing level matching its syslog
/// severity.
pub fn log_at_syslog_level(log_level: u8, message: &str) {
    match log_level {
        0..=3 => tracing::error!(target: "dmgsmith::helper", "{}", message),
        4 => tracing::warn!(target: "dmgsmith::helper", "{}", message),
        5 | 6 => tracing::info!(target: "dmgsmith::helper", "{}", message),
        _ => tracing::debug!(target: "dmgsmith::helper", "{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmgsmith_shared::progress::ProgressMessage;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn next(rx: &mut mpsc::Receiver<ProgressMessage>) -> ProgressMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn messages_arrive_in_order() {
        let temp = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let channel = ProgressChannel::listen(temp.path(), tx).unwrap();

        let sender = ProgressSender::connect(channel.path()).unwrap();
        sender.select_phase("Installing");
        sender.update_progress(12.5);
        sender.task_done(0);

        assert_eq!(
            next(&mut rx).await,
            ProgressMessage::SelectPhase {
                phase: "Installing".into()
            }
        );
        assert_eq!(
            next(&mut rx).await,
            ProgressMessage::UpdateProgress { percent: 12.5 }
        );
        assert_eq!(
            next(&mut rx).await,
            ProgressMessage::TaskDone {
                termination_status: 0
            }
        );
        channel.stop().await;
    }

    #[tokio::test]
    async fn malformed_datagrams_are_dropped() {
        let temp = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let channel = ProgressChannel::listen(temp.path(), tx).unwrap();

        let raw = std::os::unix::net::UnixDatagram::unbound().unwrap();
        raw.send_to(b"definitely not a plist", channel.path()).unwrap();

        let sender = ProgressSender::connect(channel.path()).unwrap();
        sender.update_message("still alive");

        assert_eq!(
            next(&mut rx).await,
            ProgressMessage::UpdateMessage {
                message: "still alive".into()
            }
        );
        channel.stop().await;
    }

    #[tokio::test]
    async fn stop_removes_socket_file() {
        let temp = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let channel = ProgressChannel::listen(temp.path(), tx).unwrap();
        let path = channel.path().to_path_buf();
        assert!(path.exists());

        channel.stop().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn each_listener_gets_its_own_path() {
        let temp = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let a = ProgressChannel::listen(temp.path(), tx.clone()).unwrap();
        let b = ProgressChannel::listen(temp.path(), tx).unwrap();
        assert_ne!(a.path(), b.path());
        a.stop().await;
        b.stop().await;
    }

    #[test]
    fn sending_to_missing_socket_does_not_fail() {
        let temp = tempfile::tempdir().unwrap();
        let sender = ProgressSender::connect(&temp.path().join("gone.sock")).unwrap();
        sender.task_done(1);
    }
}
