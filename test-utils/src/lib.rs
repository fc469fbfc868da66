//! Test doubles for driving dmgsmith without hdiutil, elevation or network.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dmgsmith::cache::{FetchResponse, Fetcher};
use dmgsmith::channel::ProgressSender;
use dmgsmith::disk::ImageTool;
use dmgsmith::executor::{HelperLauncher, LaunchOutcome};
use dmgsmith::scheduler::BuildObserver;
use dmgsmith::util::ToolOutput;
use dmgsmith_shared::constants::helper_cli;
use dmgsmith_shared::errors::{BuildError, BuildResult};
use dmgsmith_shared::progress::ProgressMessage;
use futures::StreamExt;
use parking_lot::Mutex;
use tempfile::TempDir;

// ============================================================================
// DISK IMAGES
// ============================================================================

/// Image tool that "mounts" images as fresh directories under a temp root.
///
/// Files registered with [`with_file`](Self::with_file) are written into the
/// mount directory on every attach. Detach can be made to fail.
pub struct FakeImageTool {
    root: TempDir,
    contents: Mutex<HashMap<PathBuf, Vec<(PathBuf, Vec<u8>)>>>,
    attaches: AtomicUsize,
    detaches: Mutex<Vec<(PathBuf, bool)>>,
    fail_detach: AtomicBool,
}

impl Default for FakeImageTool {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeImageTool {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().expect("create mount root"),
            contents: Mutex::new(HashMap::new()),
            attaches: AtomicUsize::new(0),
            detaches: Mutex::new(Vec::new()),
            fail_detach: AtomicBool::new(false),
        }
    }

    /// Put `relative` with `data` into every mount of `image`.
    pub fn with_file(&self, image: impl AsRef<Path>, relative: impl AsRef<Path>, data: &[u8]) -> &Self {
        self.contents
            .lock()
            .entry(image.as_ref().to_path_buf())
            .or_default()
            .push((relative.as_ref().to_path_buf(), data.to_vec()));
        self
    }

    /// Put an (empty) directory into every mount of `image`.
    pub fn with_dir(&self, image: impl AsRef<Path>, relative: impl AsRef<Path>) -> &Self {
        self.with_file(image, relative.as_ref().join(".keep"), b"")
    }

    pub fn fail_detach(&self, fail: bool) {
        self.fail_detach.store(fail, Ordering::SeqCst);
    }

    pub fn attach_count(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }

    /// `(mount point, force)` of every detach call.
    pub fn detach_calls(&self) -> Vec<(PathBuf, bool)> {
        self.detaches.lock().clone()
    }

    fn plist(body: &str) -> Vec<u8> {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict>{}</dict></plist>"#,
            body
        )
        .into_bytes()
    }
}

#[async_trait]
impl ImageTool for FakeImageTool {
    async fn attach(&self, image: &Path) -> BuildResult<ToolOutput> {
        let n = self.attaches.fetch_add(1, Ordering::SeqCst);
        let mount_point = self.root.path().join(format!("mnt{}", n));
        std::fs::create_dir_all(&mount_point)?;

        let files = self.contents.lock().get(image).cloned().unwrap_or_default();
        for (relative, data) in files {
            let path = mount_point.join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, data)?;
        }

        Ok(ToolOutput {
            status: 0,
            stdout: Self::plist(&format!(
                "<key>system-entities</key><array><dict>\
                 <key>mount-point</key><string>{}</string>\
                 <key>potentially-mountable</key><true/></dict></array>",
                mount_point.display()
            )),
            stderr: String::new(),
        })
    }

    async fn detach(&self, mount_point: &Path, force: bool) -> BuildResult<ToolOutput> {
        self.detaches.lock().push((mount_point.to_path_buf(), force));
        if self.fail_detach.load(Ordering::SeqCst) {
            return Ok(ToolOutput {
                status: 16,
                stdout: Vec::new(),
                stderr: "hdiutil: couldn't unmount - Resource busy".to_string(),
            });
        }
        Ok(ToolOutput::default())
    }

    async fn info(&self) -> BuildResult<ToolOutput> {
        Ok(ToolOutput {
            status: 0,
            stdout: Self::plist("<key>images</key><array/>"),
            stderr: String::new(),
        })
    }
}

// ============================================================================
// OBSERVER
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum Observed {
    Starting(PathBuf),
    TotalWeight(u64),
    Phase(String),
    Progress(f64),
    Message(String),
    Succeeded,
    Failed { message: String, details: String },
    Stopped,
    DetachFailed(PathBuf),
}

/// Observer that records every event in order.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Observed>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Observed> {
        self.events.lock().clone()
    }

    pub fn progress(&self) -> Vec<f64> {
        self.filter(|e| match e {
            Observed::Progress(p) => Some(*p),
            _ => None,
        })
    }

    pub fn phases(&self) -> Vec<String> {
        self.filter(|e| match e {
            Observed::Phase(p) => Some(p.clone()),
            _ => None,
        })
    }

    /// `(message, details)` of every reported failure.
    pub fn failures(&self) -> Vec<(String, String)> {
        self.filter(|e| match e {
            Observed::Failed { message, details } => Some((message.clone(), details.clone())),
            _ => None,
        })
    }

    pub fn total_weight(&self) -> Option<u64> {
        self.filter(|e| match e {
            Observed::TotalWeight(w) => Some(*w),
            _ => None,
        })
        .first()
        .copied()
    }

    pub fn count(&self, event: &Observed) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }

    fn filter<T>(&self, f: impl Fn(&Observed) -> Option<T>) -> Vec<T> {
        self.events.lock().iter().filter_map(f).collect()
    }

    fn push(&self, event: Observed) {
        self.events.lock().push(event);
    }
}

impl BuildObserver for RecordingObserver {
    fn build_starting(&self, output: &Path) {
        self.push(Observed::Starting(output.to_path_buf()));
    }

    fn set_total_weight(&self, total: u64) {
        self.push(Observed::TotalWeight(total));
    }

    fn set_phase(&self, phase: &str) {
        self.push(Observed::Phase(phase.to_string()));
    }

    fn set_progress(&self, progress: f64) {
        self.push(Observed::Progress(progress));
    }

    fn set_progress_message(&self, message: &str) {
        self.push(Observed::Message(message.to_string()));
    }

    fn build_succeeded(&self) {
        self.push(Observed::Succeeded);
    }

    fn build_failed(&self, message: &str, details: &str) {
        self.push(Observed::Failed {
            message: message.to_string(),
            details: details.to_string(),
        });
    }

    fn build_stopped(&self) {
        self.push(Observed::Stopped);
    }

    fn detach_failed(&self, image: &Path, _message: &str) {
        self.push(Observed::DetachFailed(image.to_path_buf()));
    }
}

// ============================================================================
// HELPER LAUNCHER
// ============================================================================

/// How a scripted helper run ends.
#[derive(Clone, Debug)]
pub enum ScriptedExit {
    Exited(i32),
    Cancelled,
    LaunchError(String),
}

#[derive(Clone, Debug)]
pub struct HelperScript {
    pub messages: Vec<ProgressMessage>,
    pub exit: ScriptedExit,
}

impl HelperScript {
    pub fn new(messages: Vec<ProgressMessage>, exit: ScriptedExit) -> Self {
        Self { messages, exit }
    }

    /// Select each phase in turn, report it half done, then `task_done(0)`.
    pub fn completing(phases: &[&str]) -> Self {
        let mut messages = vec![ProgressMessage::UpdateProgress { percent: 50.0 }];
        for phase in phases {
            messages.push(ProgressMessage::SelectPhase {
                phase: phase.to_string(),
            });
            messages.push(ProgressMessage::UpdateProgress { percent: 50.0 });
        }
        messages.push(ProgressMessage::TaskDone {
            termination_status: 0,
        });
        Self::new(messages, ScriptedExit::Exited(0))
    }
}

/// Launcher that plays back a script over the real progress socket instead
/// of running the helper.
#[derive(Default)]
pub struct ScriptedLauncher {
    install: Mutex<Option<HelperScript>>,
    scan: Mutex<Option<HelperScript>>,
    launches: Mutex<Vec<(Vec<String>, bool)>>,
}

impl ScriptedLauncher {
    pub fn new(install: HelperScript) -> Self {
        Self {
            install: Mutex::new(Some(install)),
            ..Self::default()
        }
    }

    pub fn with_scan(self, scan: HelperScript) -> Self {
        *self.scan.lock() = Some(scan);
        self
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().len()
    }

    /// `(argv, elevate)` of every launch.
    pub fn launches(&self) -> Vec<(Vec<String>, bool)> {
        self.launches.lock().clone()
    }

    fn socket_of(argv: &[String]) -> BuildResult<PathBuf> {
        argv.iter()
            .position(|a| a == helper_cli::SOCKET_FLAG)
            .and_then(|i| argv.get(i + 1))
            .map(PathBuf::from)
            .ok_or_else(|| BuildError::Internal("no --socket in helper arguments".to_string()))
    }
}

#[async_trait]
impl HelperLauncher for ScriptedLauncher {
    async fn launch(&self, argv: Vec<String>, elevate: bool) -> BuildResult<LaunchOutcome> {
        self.launches.lock().push((argv.clone(), elevate));

        let script = if argv.iter().any(|a| a == helper_cli::SCAN_SUBCOMMAND) {
            self.scan.lock().clone()
        } else {
            self.install.lock().clone()
        };
        let Some(script) = script else {
            return Ok(LaunchOutcome::Exited(0));
        };

        if let ScriptedExit::LaunchError(message) = &script.exit {
            return Err(BuildError::Process(message.clone()));
        }
        if let ScriptedExit::Cancelled = script.exit {
            return Ok(LaunchOutcome::Cancelled);
        }

        let sender = ProgressSender::connect(&Self::socket_of(&argv)?)?;
        let messages = script.messages.clone();
        tokio::task::spawn_blocking(move || {
            for message in &messages {
                sender.send(message);
            }
        })
        .await
        .map_err(|e| BuildError::Internal(format!("scripted helper panicked: {}", e)))?;

        match script.exit {
            ScriptedExit::Exited(status) => Ok(LaunchOutcome::Exited(status)),
            _ => Ok(LaunchOutcome::Cancelled),
        }
    }
}

// ============================================================================
// FETCHER
// ============================================================================

/// Serves fixed bodies by URL, in small chunks.
#[derive(Default)]
pub struct MemoryFetcher {
    bodies: Mutex<HashMap<String, (u16, Vec<u8>)>>,
    requests: Mutex<Vec<String>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, status: u16, body: &[u8]) -> &Self {
        self.bodies.lock().insert(url.to_string(), (status, body.to_vec()));
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, url: &str) -> BuildResult<FetchResponse> {
        self.requests.lock().push(url.to_string());
        let (status, body) = self
            .bodies
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| BuildError::Download(format!("no route to {}", url)))?;
        let chunks: Vec<BuildResult<Vec<u8>>> = body.chunks(1024).map(|c| Ok(c.to_vec())).collect();
        Ok(FetchResponse {
            status,
            content_length: Some(body.len() as u64),
            body: futures::stream::iter(chunks).boxed(),
        })
    }
}
