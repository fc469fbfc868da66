//! Capturing subprocess runner for the external tools the pipeline drives.

use std::process::Stdio;

use dmgsmith_shared::errors::{BuildError, BuildResult};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Exit status and captured output of a finished tool invocation.
#[derive(Clone, Debug, Default)]
pub struct ToolOutput {
    /// Exit code, or -1 when the process was killed by a signal.
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Run `program` with `args` to completion, optionally feeding `stdin`.
///
/// A nonzero exit is not an error here; callers inspect `ToolOutput::status`.
/// Only failing to launch or to collect output is.
pub async fn run_tool(program: &str, args: &[String], stdin: Option<&[u8]>) -> BuildResult<ToolOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!(program, ?args, "Running tool");

    let mut child = cmd
        .spawn()
        .map_err(|e| BuildError::Process(format!("Failed to launch {}: {}", program, e)))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input)
            .await
            .map_err(|e| BuildError::Process(format!("Failed to write to {}: {}", program, e)))?;
        // Dropping the pipe closes it so the tool sees EOF.
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| BuildError::Process(format!("Failed to wait for {}: {}", program, e)))?;

    Ok(ToolOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}
