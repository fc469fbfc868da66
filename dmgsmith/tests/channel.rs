//! Bursts of helper progress crossing the datagram socket.

use std::time::Duration;

use dmgsmith::watcher::{WatchMode, run_watched};
use dmgsmith::{ProgressChannel, ProgressMessage, ProgressSender};
use tempfile::TempDir;
use tokio::sync::mpsc;

// ============================================================================
// TEST FIXTURES
// ============================================================================

const BURST: usize = 150;

struct TestContext {
    _temp_dir: TempDir,
    channel: ProgressChannel,
    rx: mpsc::Receiver<ProgressMessage>,
}

impl TestContext {
    fn new() -> Self {
        // Short root so the socket path stays under the sun_path limit.
        let temp_dir = tempfile::Builder::new()
            .prefix("ch")
            .tempdir_in("/tmp")
            .expect("Failed to create temp dir");
        let (tx, rx) = mpsc::channel(16);
        let channel = ProgressChannel::listen(temp_dir.path(), tx).unwrap();
        Self {
            _temp_dir: temp_dir,
            channel,
            rx,
        }
    }

    /// Collect messages until `task_done` arrives.
    async fn drain(&mut self) -> Vec<ProgressMessage> {
        let mut received = Vec::new();
        loop {
            let message = tokio::time::timeout(Duration::from_secs(10), self.rx.recv())
                .await
                .expect("Timed out waiting for progress")
                .expect("Progress channel closed");
            let done = matches!(message, ProgressMessage::TaskDone { .. });
            received.push(message);
            if done {
                return received;
            }
        }
    }
}

// ============================================================================
// BURSTS
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn back_to_back_sends_all_arrive_in_order() {
    let mut ctx = TestContext::new();
    let socket = ctx.channel.path().to_path_buf();

    let mut expected: Vec<ProgressMessage> = (0..BURST)
        .map(|i| ProgressMessage::UpdateProgress { percent: i as f64 })
        .collect();
    expected.push(ProgressMessage::SelectPhase {
        phase: "asr2".into(),
    });
    expected.push(ProgressMessage::TaskDone {
        termination_status: 0,
    });

    let script = expected.clone();
    let helper = tokio::task::spawn_blocking(move || {
        let sender = ProgressSender::connect(&socket).unwrap();
        for message in &script {
            sender.send(message);
        }
    });

    let received = ctx.drain().await;
    helper.await.unwrap();

    assert_eq!(received.len(), BURST + 2);
    assert_eq!(received, expected);
    ctx.channel.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn chatty_child_output_is_not_lost() {
    let mut ctx = TestContext::new();
    let socket = ctx.channel.path().to_path_buf();

    let script = format!(
        "i=0; while [ $i -lt {} ]; do echo \"installer:%$i\"; i=$((i+1)); done; \
         echo 'IED:PHASE:Converting disk image'",
        BURST
    );
    let helper = tokio::task::spawn_blocking(move || {
        let sender = ProgressSender::connect(&socket).unwrap();
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), script];
        run_watched(&argv, None, WatchMode::Lines, &sender).unwrap()
    });

    let received = ctx.drain().await;
    assert_eq!(helper.await.unwrap(), 0);

    let percents: Vec<f64> = received
        .iter()
        .filter_map(|m| match m {
            ProgressMessage::UpdateProgress { percent } => Some(*percent),
            _ => None,
        })
        .collect();
    let expected: Vec<f64> = (0..BURST).map(|i| i as f64).collect();
    assert_eq!(percents, expected);

    assert_eq!(
        &received[received.len() - 2..],
        &[
            ProgressMessage::SelectPhase {
                phase: "Converting disk image".into()
            },
            ProgressMessage::TaskDone {
                termination_status: 0
            },
        ]
    );
    ctx.channel.stop().await;
}
