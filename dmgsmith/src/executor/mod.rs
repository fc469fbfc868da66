//! Helper process launching, with or without privilege elevation.
//!
//! The launcher only reports how the process tree ended. Everything the
//! helper has to say travels over the progress socket.

pub mod auth;

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use dmgsmith_shared::errors::{BuildError, BuildResult};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::constants::tools;
use crate::options::ElevationPolicy;

/// Resolved elevation strategy for one build.
#[derive(Clone, PartialEq, Eq)]
pub enum Elevation {
    /// Already privileged, or elevation not wanted.
    None,
    /// `sudo -kSE` with the password on stdin.
    Sudo { password: String },
    /// Interactive authorization prompt.
    Prompt,
}

impl std::fmt::Debug for Elevation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Elevation::None => write!(f, "None"),
            Elevation::Sudo { .. } => write!(f, "Sudo {{ password: <redacted> }}"),
            Elevation::Prompt => write!(f, "Prompt"),
        }
    }
}

impl Elevation {
    /// Pick a strategy from policy, the effective uid and whether a password
    /// was supplied.
    pub fn resolve(policy: ElevationPolicy, password: Option<String>) -> BuildResult<Self> {
        let is_root = nix::unistd::geteuid().is_root();
        match policy {
            ElevationPolicy::None => Ok(Elevation::None),
            ElevationPolicy::Prompt => Ok(Elevation::Prompt),
            ElevationPolicy::Sudo => password
                .map(|password| Elevation::Sudo { password })
                .ok_or_else(|| {
                    BuildError::Config("sudo elevation requires a password".to_string())
                }),
            ElevationPolicy::Auto if is_root => Ok(Elevation::None),
            ElevationPolicy::Auto => Ok(match password {
                Some(password) => Elevation::Sudo { password },
                None => Elevation::Prompt,
            }),
        }
    }
}

/// How a launched helper ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaunchOutcome {
    Exited(i32),
    /// The user dismissed the authorization prompt. A clean stop.
    Cancelled,
}

/// Runs a helper command line to completion.
#[async_trait]
pub trait HelperLauncher: Send + Sync {
    /// Run `argv` (program first). When `elevate` is false the command runs
    /// with the caller's privileges regardless of strategy.
    async fn launch(&self, argv: Vec<String>, elevate: bool) -> BuildResult<LaunchOutcome>;
}

// ============================================================================
// PRIVILEGED EXECUTOR
// ============================================================================

#[derive(Debug)]
pub struct PrivilegedExecutor {
    elevation: Elevation,
}

impl PrivilegedExecutor {
    pub fn new(elevation: Elevation) -> Self {
        Self { elevation }
    }

    pub fn elevation(&self) -> &Elevation {
        &self.elevation
    }

    async fn run_direct(&self, argv: &[String]) -> BuildResult<LaunchOutcome> {
        let (program, args) = split_argv(argv)?;
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| BuildError::Process(format!("Failed to launch {}: {}", program, e)))?;
        tracing::info!(program, status = exit_code(status), "Helper finished");
        Ok(LaunchOutcome::Exited(exit_code(status)))
    }

    async fn run_sudo(&self, argv: &[String], password: &str) -> BuildResult<LaunchOutcome> {
        split_argv(argv)?;
        let mut child = Command::new(tools::SUDO)
            .arg("-kSE")
            .args(argv)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BuildError::Process(format!("Failed to launch sudo: {}", e)))?;
        tracing::info!("Install task launched with sudo");

        if let Some(mut stdin) = child.stdin.take() {
            let line = format!("{}\n", password);
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| BuildError::Process(format!("Failed to pass password to sudo: {}", e)))?;
        }

        let status = child
            .wait()
            .await
            .map_err(|e| BuildError::Process(format!("Failed to wait for sudo: {}", e)))?;
        Ok(LaunchOutcome::Exited(exit_code(status)))
    }

    async fn run_prompt(&self, argv: &[String]) -> BuildResult<LaunchOutcome> {
        split_argv(argv)?;
        if cfg!(target_os = "macos") {
            self.run_osascript(argv).await
        } else {
            self.run_pkexec(argv).await
        }
    }

    /// `do shell script ... with administrator privileges`, with the argument
    /// vector passed through `on run argv` so nothing is quoted by hand.
    async fn run_osascript(&self, argv: &[String]) -> BuildResult<LaunchOutcome> {
        const SCRIPT: &str = "on run argv
    set cmd to \"\"
    repeat with a in argv
        set cmd to cmd & quoted form of (a as text) & \" \"
    end repeat
    do shell script cmd with administrator privileges
end run";

        let output = Command::new(tools::OSASCRIPT)
            .arg("-e")
            .arg(SCRIPT)
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BuildError::Process(format!("Failed to launch osascript: {}", e)))?;

        if output.status.success() {
            return Ok(LaunchOutcome::Exited(0));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        match auth::applescript_error_number(&stderr) {
            Some(auth::APPLESCRIPT_CANCELLED) | Some(auth::CANCELLED) => {
                tracing::debug!("User cancelled auth.");
                Ok(LaunchOutcome::Cancelled)
            }
            Some(code) if code <= -60000 => Err(BuildError::Process(auth::describe(code))),
            // The shell script ran and failed; osascript reports its status
            // as the error number.
            Some(code) if code > 0 => Ok(LaunchOutcome::Exited(code)),
            _ => Ok(LaunchOutcome::Exited(exit_code(output.status))),
        }
    }

    async fn run_pkexec(&self, argv: &[String]) -> BuildResult<LaunchOutcome> {
        let status = Command::new(tools::PKEXEC)
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| BuildError::Process(format!("Failed to launch pkexec: {}", e)))?;
        match exit_code(status) {
            auth::PKEXEC_NOT_AUTHORIZED => {
                tracing::debug!("User cancelled auth.");
                Ok(LaunchOutcome::Cancelled)
            }
            auth::PKEXEC_NO_AGENT => Err(BuildError::Process(auth::describe(-60007))),
            code => Ok(LaunchOutcome::Exited(code)),
        }
    }
}

#[async_trait]
impl HelperLauncher for PrivilegedExecutor {
    async fn launch(&self, argv: Vec<String>, elevate: bool) -> BuildResult<LaunchOutcome> {
        if !elevate {
            return self.run_direct(&argv).await;
        }
        match &self.elevation {
            Elevation::None => self.run_direct(&argv).await,
            Elevation::Sudo { password } => self.run_sudo(&argv, password).await,
            Elevation::Prompt => self.run_prompt(&argv).await,
        }
    }
}

fn split_argv(argv: &[String]) -> BuildResult<(&str, &[String])> {
    argv.split_first()
        .map(|(program, args)| (program.as_str(), args))
        .ok_or_else(|| BuildError::Internal("empty helper command line".to_string()))
}

/// Exit code, or 128 + signal for a killed process.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}
