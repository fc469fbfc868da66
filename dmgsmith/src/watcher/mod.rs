//! Progress watching for the helper binary.
//!
//! The helper runs the real work (the install script or `asr imagescan`)
//! as a child, reads its combined stdout/stderr, translates it into
//! [`ProgressMessage`](dmgsmith_shared::ProgressMessage)s and posts them to
//! the scheduler's socket. When the child exits, `task_done` carries its
//! status.

mod parse;

pub use parse::{AsrParser, LineParser, OutputParser};

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};

use dmgsmith_shared::errors::{BuildError, BuildResult};

use crate::channel::ProgressSender;

/// How child output is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchMode {
    /// Line protocol of the install script.
    Lines,
    /// Streaming `asr` progress.
    Asr,
}

impl WatchMode {
    fn parser(self) -> Box<dyn OutputParser> {
        match self {
            WatchMode::Lines => Box::new(LineParser::new()),
            WatchMode::Asr => Box::new(AsrParser::new()),
        }
    }
}

/// Run `argv` to completion, forwarding its progress to `sender`.
///
/// Returns the child's exit status, which has also been posted as
/// `task_done`. Errors mean the child could not be run at all.
pub fn run_watched(
    argv: &[String],
    cwd: Option<&Path>,
    mode: WatchMode,
    sender: &ProgressSender,
) -> BuildResult<i32> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| BuildError::Internal("empty command line".to_string()))?;

    let (mut reader, writer) = std::io::pipe()
        .map_err(|e| BuildError::Process(format!("Failed to create pipe: {}", e)))?;
    let writer_err = writer
        .try_clone()
        .map_err(|e| BuildError::Process(format!("Failed to create pipe: {}", e)))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(writer)
        .stderr(writer_err);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    tracing::info!(program = %program, ?args, ?mode, "Launching watched task");
    let mut child = cmd
        .spawn()
        .map_err(|e| BuildError::Process(format!("Failed to launch {}: {}", program, e)))?;
    // Release our copies of the write end so EOF arrives when the child exits.
    drop(cmd);

    let mut parser = mode.parser();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                for message in parser.feed(&buf[..n]) {
                    sender.send(&message);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!("Failed to read task output: {}", e);
                break;
            }
        }
    }
    for message in parser.finish() {
        sender.send(&message);
    }

    let status = child
        .wait()
        .map_err(|e| BuildError::Process(format!("Failed to wait for {}: {}", program, e)))?;
    let code = {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .or_else(|| status.signal().map(|s| 128 + s))
            .unwrap_or(-1)
    };
    tracing::info!(program = %program, status = code, "Watched task finished");
    sender.task_done(code);
    Ok(code)
}
