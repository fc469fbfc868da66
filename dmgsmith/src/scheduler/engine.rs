//! The build state machine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dmgsmith_shared::constants::{exit_status, helper_cli};
use dmgsmith_shared::errors::{BuildError, BuildResult};
use dmgsmith_shared::progress::ProgressMessage;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Failure;
use super::observer::BuildObserver;
use super::plan::{BuildStatus, PlanInputs, Schedule, TaskKind, build_tasks};
use super::prepare::{self, PrepareContext, Prepared};
use crate::channel::{ProgressChannel, log_at_syslog_level};
use crate::constants::HELPER_BINARY;
use crate::disk::DiskImageManager;
use crate::executor::{HelperLauncher, LaunchOutcome};
use crate::options::BuildOptions;
use crate::package::Package;
use crate::sizing::SizeEstimator;
use crate::source::{SourceInfo, SourceKind};
use crate::template::Template;
use crate::util::find_binary;

/// Capacity of the queues feeding the scheduler task.
const PROGRESS_QUEUE: usize = 256;
const WORKER_QUEUE: usize = 8;

/// Everything one build needs to know.
#[derive(Clone, Debug)]
pub struct BuildRequest {
    pub source: SourceInfo,
    pub output_path: PathBuf,
    pub volume_name: String,
    /// Requested output size in GB. Computed from the packages when unset.
    pub volume_size_gb: Option<u64>,
    /// Additional packages and updates, installed in order after the OS.
    pub packages: Vec<Package>,
    /// Embedded into the image by the install helper.
    pub template: Template,
}

/// Collaborators the scheduler drives.
#[derive(Clone)]
pub struct BuildServices {
    pub images: Arc<DiskImageManager>,
    pub launcher: Arc<dyn HelperLauncher>,
    pub sizer: Arc<dyn SizeEstimator>,
}

/// How a build ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    Succeeded { output: PathBuf },
    Failed { message: String, details: String },
    /// Stopped by the user before the helper started, or at the
    /// authorization prompt. Not a failure.
    Cancelled,
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BuildOutcome::Succeeded { .. })
    }
}

impl From<Failure> for BuildOutcome {
    fn from(f: Failure) -> Self {
        BuildOutcome::Failed {
            message: f.message,
            details: f.details,
        }
    }
}

/// Starts builds. One build at a time per scheduler is the expected use.
pub struct BuildScheduler {
    options: BuildOptions,
    services: BuildServices,
    observer: Arc<dyn BuildObserver>,
    scratch_root: PathBuf,
}

impl BuildScheduler {
    /// `scratch_root` receives each build's temporary directory, which holds
    /// the saved template and the progress socket.
    pub fn new(
        options: BuildOptions,
        services: BuildServices,
        observer: Arc<dyn BuildObserver>,
        scratch_root: PathBuf,
    ) -> Self {
        Self {
            options,
            services,
            observer,
            scratch_root,
        }
    }

    /// Start `request` on its own task.
    pub fn start(&self, request: BuildRequest) -> BuildHandle {
        let cancel = CancellationToken::new();
        let build = Build::new(
            self.options.clone(),
            self.services.clone(),
            Arc::clone(&self.observer),
            self.scratch_root.clone(),
            request,
        );
        let join = tokio::spawn(build.run(cancel.clone()));
        BuildHandle { cancel, join }
    }
}

/// A running build.
#[derive(Debug)]
pub struct BuildHandle {
    cancel: CancellationToken,
    join: JoinHandle<BuildOutcome>,
}

impl BuildHandle {
    /// Ask for a clean stop. Honoured until the install helper has been
    /// launched; ignored afterwards.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the build, including teardown, to finish.
    pub async fn wait(self) -> BuildResult<BuildOutcome> {
        self.join
            .await
            .map_err(|e| BuildError::Internal(format!("build task failed: {}", e)))
    }
}

// ============================================================================
// BUILD STATE
// ============================================================================

/// Results of worker tasks, handed back to the owning task.
enum WorkerEvent {
    Prepared(Result<Prepared, Failure>),
    InstallExited(BuildResult<LaunchOutcome>),
    FinalizeExited(BuildResult<LaunchOutcome>),
}

enum Step {
    Continue,
    Done(BuildOutcome),
}

/// State of one build. Lives on the build's task and is mutated only there.
struct Build {
    options: BuildOptions,
    services: BuildServices,
    observer: Arc<dyn BuildObserver>,
    scratch_root: PathBuf,
    request: BuildRequest,

    schedule: Schedule,
    status: BuildStatus,
    scratch: Option<TempDir>,
    socket_path: PathBuf,
    template_path: PathBuf,
    prepared: Option<Prepared>,
    workers: Vec<JoinHandle<()>>,
    helper_started: bool,
    install_exited: bool,
    /// Helper status in the already-reported band, seen without a failure.
    reported_status: Option<i32>,
    last_message: Option<String>,
}

impl Build {
    fn new(
        options: BuildOptions,
        services: BuildServices,
        observer: Arc<dyn BuildObserver>,
        scratch_root: PathBuf,
        request: BuildRequest,
    ) -> Self {
        let tasks = build_tasks(&PlanInputs {
            source_kind: request.source.kind,
            packages: &request.packages,
            finalize_scan: options.finalize_scan,
        });
        for task in &tasks {
            tracing::info!("Task {} with {} phases:", task.kind.title(), task.phases.len());
            for phase in &task.phases {
                tracing::info!(
                    "    Phase '{}' with weight {:.1}",
                    phase.title,
                    phase.weight as f64 / 1_048_576.0
                );
            }
        }

        Self {
            options,
            services,
            observer,
            scratch_root,
            request,
            schedule: Schedule::new(tasks),
            status: BuildStatus::Idle,
            scratch: None,
            socket_path: PathBuf::new(),
            template_path: PathBuf::new(),
            prepared: None,
            workers: Vec::new(),
            helper_started: false,
            install_exited: false,
            reported_status: None,
            last_message: None,
        }
    }

    async fn run(mut self, cancel: CancellationToken) -> BuildOutcome {
        tracing::info!(
            "Using installer: {} {} {}",
            self.request.source.name,
            self.request.source.version,
            self.request.source.build
        );
        tracing::info!(output = %self.request.output_path.display(), "Starting build");
        self.observer.build_starting(&self.request.output_path);

        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_QUEUE);
        let (outcome, channel) = match self.setup(progress_tx) {
            Ok(channel) => {
                let outcome = self.drive(progress_rx, cancel).await;
                (outcome, Some(channel))
            }
            Err(failure) => (self.fail(failure), None),
        };

        self.stop(channel).await;
        outcome
    }

    /// Scratch directory, saved template and progress socket.
    fn setup(&mut self, progress_tx: mpsc::Sender<ProgressMessage>) -> Result<ProgressChannel, Failure> {
        let scratch = tempfile::Builder::new()
            .prefix("dmgsmith.")
            .tempdir_in(&self.scratch_root)
            .map_err(|e| Failure::new("Couldn't create temporary directory", e.to_string()))?;
        tracing::debug!(scratch = %scratch.path().display(), "Created temporary directory");

        let datestamp = chrono::Local::now().format("%Y%m%d");
        self.template_path = scratch.path().join(format!("dmgsmith-{}.adtmpl", datestamp));
        tracing::debug!(template = %self.template_path.display(), "Saving template");
        self.request
            .template
            .save(&self.template_path)
            .map_err(|e| Failure::new("Couldn't save template to tempdir", e.to_string()))?;

        self.observer.set_total_weight(self.schedule.total_weight());

        let channel = ProgressChannel::listen(scratch.path(), progress_tx)
            .map_err(|e| Failure::new("Couldn't create progress socket", e.to_string()))?;
        self.socket_path = channel.path().to_path_buf();
        self.scratch = Some(scratch);
        Ok(channel)
    }

    async fn drive(
        &mut self,
        mut progress_rx: mpsc::Receiver<ProgressMessage>,
        cancel: CancellationToken,
    ) -> BuildOutcome {
        let (worker_tx, mut worker_rx) = mpsc::channel(WORKER_QUEUE);
        let mut step = self.advance(&worker_tx);
        loop {
            if let Step::Done(outcome) = step {
                return outcome;
            }
            step = tokio::select! {
                biased;
                _ = cancel.cancelled(), if !self.helper_started => {
                    tracing::info!("Build cancelled");
                    Step::Done(BuildOutcome::Cancelled)
                }
                message = progress_rx.recv() => match message {
                    Some(message) => self.handle_message(message, &worker_tx),
                    // The listener only stops at teardown.
                    None => Step::Done(self.fail(Failure::new(
                        "Build failed",
                        "Lost contact with the progress channel",
                    ))),
                },
                Some(event) = worker_rx.recv() => self.handle_worker(event, &worker_tx),
            };
        }
    }

    fn fail(&mut self, failure: Failure) -> BuildOutcome {
        tracing::error!("Workflow failed: {} ({})", failure.message, failure.details);
        self.status = BuildStatus::Failed;
        self.observer.build_failed(&failure.message, &failure.details);
        failure.into()
    }

    /// Teardown. Runs once per build.
    async fn stop(&mut self, channel: Option<ProgressChannel>) {
        tracing::debug!(status = ?self.status, "Workflow stopping");
        for worker in self.workers.drain(..) {
            worker.abort();
        }
        if let Some(channel) = channel {
            channel.stop().await;
        }
        if let Some(scratch) = self.scratch.take() {
            let path = scratch.path().to_path_buf();
            if let Err(e) = scratch.close() {
                tracing::warn!(scratch = %path.display(), "Failed to delete temporary directory: {}", e);
            }
        }
        self.detach_package_images().await;
        self.observer.build_stopped();
    }

    async fn detach_package_images(&self) {
        let tracked = self.services.images.tracked();
        let images: Vec<&Path> = self
            .request
            .packages
            .iter()
            .map(Package::path)
            .filter(|p| prepare::is_disk_image(p) && tracked.iter().any(|t| t == p))
            .collect();
        let results = futures::future::join_all(images.iter().map(|image| async move {
            (*image, self.services.images.detach(image).await)
        }))
        .await;
        for (image, result) in results {
            if let Err(e) = result {
                tracing::warn!(image = %image.display(), "Failed to detach package image: {}", e);
                self.observer.detach_failed(image, &e.to_string());
            }
        }
    }

    // ========================================================================
    // TASKS
    // ========================================================================

    /// Move on to the next task and start it.
    fn advance(&mut self, worker_tx: &mpsc::Sender<WorkerEvent>) -> Step {
        let kind = match self.schedule.next_task(self.observer.as_ref()) {
            Ok(Some(kind)) => kind,
            Ok(None) => {
                tracing::info!(
                    output = %self.request.output_path.display(),
                    "Build finished successfully"
                );
                self.status = BuildStatus::Succeeded;
                self.observer.build_succeeded();
                return Step::Done(BuildOutcome::Succeeded {
                    output: self.request.output_path.clone(),
                });
            }
            Err(e) => return Step::Done(self.fail(e.into())),
        };
        self.status = kind.status();

        match kind {
            TaskKind::Prepare => {
                self.start_prepare(worker_tx);
                Step::Continue
            }
            TaskKind::Install => match self.start_install(worker_tx) {
                Ok(()) => Step::Continue,
                Err(failure) => Step::Done(self.fail(failure)),
            },
            TaskKind::Finalize => match self.start_finalize(worker_tx) {
                Ok(()) => Step::Continue,
                Err(failure) => Step::Done(self.fail(failure)),
            },
            TaskKind::Finish => {
                tracing::info!("Finish");
                self.schedule.finish(self.observer.as_ref());
                self.advance(worker_tx)
            }
        }
    }

    fn spawn_worker<F>(&mut self, worker_tx: &mpsc::Sender<WorkerEvent>, work: F)
    where
        F: std::future::Future<Output = WorkerEvent> + Send + 'static,
    {
        let tx = worker_tx.clone();
        self.workers.push(tokio::spawn(async move {
            let event = work.await;
            if tx.send(event).await.is_err() {
                tracing::debug!("Build finished before worker reported back");
            }
        }));
    }

    fn start_prepare(&mut self, worker_tx: &mpsc::Sender<WorkerEvent>) {
        let ctx = PrepareContext {
            images: Arc::clone(&self.services.images),
            sizer: Arc::clone(&self.services.sizer),
            options: self.options.clone(),
        };
        let source = self.request.source.clone();
        let packages = self.request.packages.clone();
        let volume_size = self.request.volume_size_gb;
        self.spawn_worker(worker_tx, async move {
            WorkerEvent::Prepared(prepare::run(ctx, source, packages, volume_size).await)
        });
    }

    fn helper_path(&self) -> Result<PathBuf, Failure> {
        match &self.options.helper_path {
            Some(path) => Ok(path.clone()),
            None => find_binary(HELPER_BINARY)
                .map_err(|e| Failure::new("Build failed", e.to_string())),
        }
    }

    fn install_argv(&self, prepared: &Prepared) -> Result<Vec<String>, Failure> {
        let helper = self.helper_path()?;
        let resources = match &self.options.resources_dir {
            Some(dir) => dir.clone(),
            None => helper.parent().map(Path::to_path_buf).unwrap_or_default(),
        };

        let mut argv = vec![
            helper.display().to_string(),
            helper_cli::CD_FLAG.to_string(),
            resources.display().to_string(),
            helper_cli::SOCKET_FLAG.to_string(),
            self.socket_path.display().to_string(),
            helper_cli::INSTALL_SUBCOMMAND.to_string(),
            "--user".to_string(),
            nix::unistd::getuid().as_raw().to_string(),
            "--group".to_string(),
            nix::unistd::getgid().as_raw().to_string(),
            "--output".to_string(),
            self.request.output_path.display().to_string(),
            "--volume-name".to_string(),
            self.request.volume_name.clone(),
            "--size".to_string(),
            prepared.volume_size_gb.to_string(),
            "--template".to_string(),
            self.template_path.display().to_string(),
        ];
        if self.request.source.kind == SourceKind::SystemImage {
            argv.push("--baseimage".to_string());
            argv.push(self.request.source.path.display().to_string());
        }
        argv.extend(prepared.install_paths.iter().map(|p| p.display().to_string()));
        Ok(argv)
    }

    fn start_install(&mut self, worker_tx: &mpsc::Sender<WorkerEvent>) -> Result<(), Failure> {
        tracing::info!("Install task running");
        let prepared = self.prepared.as_ref().ok_or_else(|| {
            Failure::new("Build failed", "Install started before preparation finished")
        })?;
        let argv = self.install_argv(prepared)?;
        tracing::info!("Launching install with arguments:");
        for arg in &argv {
            tracing::info!("    '{}'", arg);
        }

        self.helper_started = true;
        let launcher = Arc::clone(&self.services.launcher);
        self.spawn_worker(worker_tx, async move {
            WorkerEvent::InstallExited(launcher.launch(argv, true).await)
        });
        Ok(())
    }

    fn start_finalize(&mut self, worker_tx: &mpsc::Sender<WorkerEvent>) -> Result<(), Failure> {
        tracing::info!("Finalize task running");
        self.observer.set_progress_message("Scanning disk image for restore");

        let helper = self.helper_path().map_err(|f| {
            Failure::new("Finalize failed", format!("Failed to launch finalize task: {}", f.details))
        })?;
        let argv = vec![
            helper.display().to_string(),
            helper_cli::SOCKET_FLAG.to_string(),
            self.socket_path.display().to_string(),
            helper_cli::SCAN_SUBCOMMAND.to_string(),
            self.request.output_path.display().to_string(),
        ];
        tracing::info!("Launching finalize with arguments: {:?}", argv);

        let launcher = Arc::clone(&self.services.launcher);
        self.spawn_worker(worker_tx, async move {
            WorkerEvent::FinalizeExited(launcher.launch(argv, false).await)
        });
        Ok(())
    }

    fn handle_worker(&mut self, event: WorkerEvent, worker_tx: &mpsc::Sender<WorkerEvent>) -> Step {
        match event {
            WorkerEvent::Prepared(Ok(prepared)) => {
                self.prepared = Some(prepared);
                self.advance(worker_tx)
            }
            WorkerEvent::Prepared(Err(failure)) => Step::Done(self.fail(failure)),

            WorkerEvent::InstallExited(result) => {
                self.install_exited = true;
                match result {
                    Ok(LaunchOutcome::Exited(0)) => {
                        tracing::info!("Install task finished with exit status 0");
                        match self.reported_status {
                            Some(status) if self.schedule.current_task() == Some(TaskKind::Install) => {
                                Step::Done(self.fail(helper_failure(status)))
                            }
                            _ => Step::Continue,
                        }
                    }
                    Ok(LaunchOutcome::Exited(status)) => Step::Done(self.fail(Failure::new(
                        "Build failed",
                        format!("Install task failed with status {}", status),
                    ))),
                    Ok(LaunchOutcome::Cancelled) => {
                        tracing::debug!("User cancelled auth.");
                        Step::Done(BuildOutcome::Cancelled)
                    }
                    Err(e) if e.is_cancelled() => {
                        tracing::debug!("User cancelled auth.");
                        Step::Done(BuildOutcome::Cancelled)
                    }
                    Err(e) => {
                        tracing::warn!("Install task launch failed: {}", e);
                        Step::Done(self.fail(Failure::new("Build failed", e.to_string())))
                    }
                }
            }

            WorkerEvent::FinalizeExited(result) => match result {
                Ok(LaunchOutcome::Exited(0)) => {
                    tracing::debug!("Finalize exited with status 0");
                    Step::Continue
                }
                Ok(LaunchOutcome::Exited(status)) => Step::Done(self.fail(Failure::new(
                    "Finalize failed",
                    format!("Finalize task failed with status {}", status),
                ))),
                Ok(LaunchOutcome::Cancelled) => Step::Done(BuildOutcome::Cancelled),
                Err(e) => Step::Done(self.fail(Failure::new(
                    "Finalize failed",
                    format!("Failed to launch finalize task: {}", e),
                ))),
            },
        }
    }

    // ========================================================================
    // PROGRESS MESSAGES
    // ========================================================================

    fn handle_message(&mut self, message: ProgressMessage, worker_tx: &mpsc::Sender<WorkerEvent>) -> Step {
        match message {
            ProgressMessage::UpdateProgress { percent } => {
                self.schedule.update_progress(percent, self.observer.as_ref());
                Step::Continue
            }
            ProgressMessage::UpdateMessage { message } => {
                if self.last_message.as_deref() != Some(message.as_str()) {
                    tracing::info!("{}", message);
                }
                self.observer.set_progress_message(&message);
                self.last_message = Some(message);
                Step::Continue
            }
            ProgressMessage::SelectPhase { phase } => {
                tracing::info!("Script phase: {}", phase);
                match self.schedule.next_phase(self.observer.as_ref()) {
                    Ok(()) => Step::Continue,
                    Err(e) => Step::Done(self.fail(e.into())),
                }
            }
            ProgressMessage::LogMessage { log_level, message } => {
                log_at_syslog_level(log_level, &message);
                Step::Continue
            }
            ProgressMessage::NotifyFailure { message } => {
                Step::Done(self.fail(Failure::new("Build failed", message)))
            }
            ProgressMessage::NotifySuccess { message } => {
                tracing::info!("Build success: {}", message);
                Step::Continue
            }
            ProgressMessage::TaskDone { termination_status: 0 } => self.advance(worker_tx),
            ProgressMessage::TaskDone { termination_status } => {
                tracing::error!("Task exited with status {}", termination_status);
                if !exit_status::is_reported_failure(termination_status) {
                    return Step::Done(self.fail(helper_failure(termination_status)));
                }
                // Preceded by notify_failure in normal operation. If the
                // helper has already gone without one, nothing else will
                // end the build.
                if self.install_exited && self.schedule.current_task() == Some(TaskKind::Install) {
                    return Step::Done(self.fail(helper_failure(termination_status)));
                }
                self.reported_status = Some(termination_status);
                Step::Continue
            }
            other @ ProgressMessage::Unknown => Step::Done(self.fail(Failure::new(
                "Unknown progress notification",
                format!("Message: {:?}", other),
            ))),
        }
    }
}

fn helper_failure(status: i32) -> Failure {
    Failure::new("Build failed", BuildError::Helper { status }.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{DetachPolicy, ImageTool};
    use crate::sizing::{SizeEstimate, SizeStrategy};
    use crate::util::ToolOutput;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Quiet {
        failures: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ImageTool for Quiet {
        async fn attach(&self, _image: &Path) -> BuildResult<ToolOutput> {
            Err(BuildError::Process("no images here".into()))
        }

        async fn detach(&self, _mount_point: &Path, _force: bool) -> BuildResult<ToolOutput> {
            Err(BuildError::Process("no images here".into()))
        }

        async fn info(&self) -> BuildResult<ToolOutput> {
            Err(BuildError::Process("no images here".into()))
        }
    }

    #[async_trait]
    impl HelperLauncher for Quiet {
        async fn launch(&self, _argv: Vec<String>, _elevate: bool) -> BuildResult<LaunchOutcome> {
            Ok(LaunchOutcome::Exited(0))
        }
    }

    #[async_trait]
    impl SizeEstimator for Quiet {
        async fn estimate(&self, _path: &Path) -> BuildResult<SizeEstimate> {
            Ok(SizeEstimate {
                bytes: 1024,
                strategy: SizeStrategy::OnDisk,
            })
        }
    }

    impl BuildObserver for Quiet {
        fn build_starting(&self, _output: &Path) {}
        fn set_total_weight(&self, _total: u64) {}
        fn set_phase(&self, _phase: &str) {}
        fn set_progress(&self, _progress: f64) {}
        fn set_progress_message(&self, _message: &str) {}
        fn build_succeeded(&self) {}
        fn build_failed(&self, message: &str, details: &str) {
            self.failures.lock().push((message.into(), details.into()));
        }
        fn build_stopped(&self) {}
    }

    fn build(quiet: &Arc<Quiet>, scratch_root: &Path) -> Build {
        let policy = DetachPolicy {
            attempts: 1,
            force_from: 1,
            delay: Duration::ZERO,
        };
        let services = BuildServices {
            images: Arc::new(DiskImageManager::new(quiet.clone(), policy)),
            launcher: quiet.clone(),
            sizer: quiet.clone(),
        };
        let request = BuildRequest {
            source: SourceInfo {
                path: PathBuf::from("/Volumes/OS X Base System"),
                image_path: PathBuf::from("/tmp/base.dmg"),
                mount_point: PathBuf::from("/Volumes/OS X Base System"),
                kind: SourceKind::SystemImage,
                name: "OS X El Capitan".into(),
                version: "10.11.6".into(),
                build: "15G31".into(),
                embedded_template: None,
            },
            output_path: scratch_root.join("out.dmg"),
            volume_name: "Macintosh HD".into(),
            volume_size_gb: Some(32),
            packages: Vec::new(),
            template: Template::new(),
        };
        Build::new(
            BuildOptions::default(),
            services,
            quiet.clone(),
            scratch_root.to_path_buf(),
            request,
        )
    }

    #[tokio::test]
    async fn closed_progress_channel_fails_the_build() {
        let temp = tempfile::tempdir().unwrap();
        let quiet = Arc::new(Quiet::default());
        let mut build = build(&quiet, temp.path());

        let (progress_tx, progress_rx) = mpsc::channel(1);
        drop(progress_tx);

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            build.drive(progress_rx, CancellationToken::new()),
        )
        .await
        .expect("drive kept waiting on a closed channel");

        assert_eq!(
            outcome,
            BuildOutcome::Failed {
                message: "Build failed".into(),
                details: "Lost contact with the progress channel".into(),
            }
        );
        assert_eq!(build.status, BuildStatus::Failed);
        assert_eq!(quiet.failures.lock().len(), 1);
    }
}
