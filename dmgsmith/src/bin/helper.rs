//! Progress-watching helper.
//!
//! Launched by the build scheduler, usually with elevated privileges. It runs
//! the install script or `asr imagescan`, translates their output into
//! progress messages and posts them to the scheduler's socket. The last
//! message is always `task_done` with the child's exit status.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use dmgsmith::channel::ProgressSender;
use dmgsmith::constants::{exit_status, media, tools};
use dmgsmith::layout::FilesystemLayout;
use dmgsmith::util;
use dmgsmith::watcher::{WatchMode, run_watched};
use dmgsmith_shared::errors::{BuildError, BuildResult};
use tracing_subscriber::EnvFilter;

/// dmgsmith helper - runs a build step and reports its progress
#[derive(Parser, Debug)]
#[command(author, version, about = "dmgsmith helper process - runs a build step and reports progress")]
struct HelperArgs {
    /// Working directory for the wrapped program
    #[arg(long = "cd")]
    cd: Option<PathBuf>,

    /// Progress socket of the scheduler
    #[arg(long)]
    socket: PathBuf,

    #[command(subcommand)]
    command: HelperCommand,
}

#[derive(Subcommand, Debug)]
enum HelperCommand {
    /// Install an OS and packages into a new disk image
    #[command(name = "installesdtodmg")]
    InstallEsdToDmg(InstallArgs),

    /// Scan a disk image for restore
    #[command(name = "imagescan")]
    ImageScan {
        image: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct InstallArgs {
    /// Owner uid of the output image
    #[arg(long, required = true)]
    user: String,

    /// Owner gid of the output image
    #[arg(long, required = true)]
    group: String,

    #[arg(long, required = true)]
    output: PathBuf,

    #[arg(long, default_value = media::DEFAULT_VOLUME_NAME)]
    volume_name: String,

    /// Image size in GB
    #[arg(long, default_value = "32")]
    size: String,

    /// Template to embed in the image
    #[arg(long, required = true)]
    template: PathBuf,

    /// System image to use instead of installing an OS
    #[arg(long)]
    baseimage: Option<PathBuf>,

    packages: Vec<PathBuf>,
}

/// Initialize tracing with file logging.
///
/// Logs go to <home>/logs/dmgsmith-helper.log with daily rotation, or to
/// stderr when that directory can't be created. The returned guard keeps the
/// background writer alive.
fn init_logging(layout: &FilesystemLayout) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let logs_dir = layout.logs_dir();

    if let Err(e) = std::fs::create_dir_all(&logs_dir) {
        util::register_to_tracing(std::io::stderr, env_filter, false);
        tracing::warn!(logs_dir = %logs_dir.display(), "Failed to create logs directory: {}", e);
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(logs_dir, "dmgsmith-helper.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    util::register_to_tracing(non_blocking, env_filter, false);
    Some(guard)
}

fn install_argv(args: &InstallArgs) -> Vec<String> {
    let mut argv = vec![
        tools::INSTALL_SCRIPT.to_string(),
        args.user.clone(),
        args.group.clone(),
        args.output.display().to_string(),
        args.volume_name.clone(),
        args.size.clone(),
        args.template.display().to_string(),
    ];
    if let Some(base) = &args.baseimage {
        argv.push(base.display().to_string());
    }
    argv.extend(args.packages.iter().map(|p| p.display().to_string()));
    argv
}

/// Make the real uid root when only the effective uid is, so the script's
/// own children inherit full privileges.
fn become_root() -> BuildResult<()> {
    use nix::unistd::{Uid, getuid, geteuid, setuid};

    if geteuid().is_root() && !getuid().is_root() {
        tracing::debug!(uid = getuid().as_raw(), "Setting real uid to 0");
        setuid(Uid::from_raw(0))
            .map_err(|e| BuildError::Process(format!("Failed to set uid to 0: {}", e)))?;
    }
    Ok(())
}

fn run(args: HelperArgs) -> BuildResult<i32> {
    let sender = ProgressSender::connect(&args.socket)?;

    match args.command {
        HelperCommand::InstallEsdToDmg(install) => {
            become_root()?;
            let argv = install_argv(&install);
            run_watched(&argv, args.cd.as_deref(), WatchMode::Lines, &sender)
        }
        HelperCommand::ImageScan { image } => {
            let argv = vec![
                tools::ASR.to_string(),
                "imagescan".to_string(),
                "--source".to_string(),
                image.display().to_string(),
            ];
            run_watched(&argv, args.cd.as_deref(), WatchMode::Asr, &sender)
        }
    }
}

fn main() -> ExitCode {
    let args = HelperArgs::parse();

    let layout = FilesystemLayout::from_env()
        .unwrap_or_else(|_| FilesystemLayout::new(std::env::temp_dir().join("dmgsmith")));
    let _log_guard = init_logging(&layout);

    tracing::info!(command = ?args.command, socket = %args.socket.display(), "Helper starting");

    match run(args) {
        Ok(status) => {
            tracing::info!(status, "Wrapped task finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("Helper failed: {}", e);
            eprintln!("dmgsmith-helper: {}", e);
            ExitCode::from(exit_status::SOFTWARE as u8)
        }
    }
}
