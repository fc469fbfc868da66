use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use dmgsmith::cache::HttpFetcher;
use dmgsmith::util::format_bytes;
use dmgsmith::{
    BuildObserver, BuildOptions, BuildOutcome, BuildRequest, BuildScheduler, BuildServices,
    DetachPolicy, DiskImageManager, Elevation, ElevationPolicy, Hdiutil, Package, PackageSizer,
    PrivilegedExecutor, SourceInspector, Template,
};
use parking_lot::Mutex;
use tokio::io::AsyncBufReadExt;

use super::{CommandFailure, download_updates, load_profiles, open_cache, profile, update_package};

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// OS installer, system image or template (.plist, .adtmpl)
    pub source: PathBuf,

    /// Output image path
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Installer to use instead of the template's
    #[arg(short, long)]
    pub installer: Option<PathBuf>,

    /// Volume name of the installed system
    #[arg(short, long)]
    pub name: Option<String>,

    /// Volume size of the installed system, in GB
    #[arg(short, long)]
    pub size: Option<u64>,

    /// Skip scanning the finished image for restore
    #[arg(long)]
    pub skip_asr_imagescan: bool,

    /// Apply updates from the update profile
    #[arg(short, long)]
    pub updates: bool,

    /// Download updates missing from the cache
    #[arg(short = 'U', long)]
    pub download_updates: bool,

    /// Overwrite the output image
    #[arg(short, long)]
    pub force: bool,

    /// Read the sudo password from the first line of stdin
    #[arg(long)]
    pub password_stdin: bool,

    /// Update profiles to use instead of the ones in the home directory
    #[arg(long)]
    pub profiles: Option<PathBuf>,

    /// Additional packages to install
    pub packages: Vec<String>,
}

fn is_template(path: &Path) -> bool {
    path.is_file()
        && path.extension().is_some_and(|ext| {
            ext.eq_ignore_ascii_case("plist") || ext.eq_ignore_ascii_case("adtmpl")
        })
}

/// Template from the source argument with command line overrides applied.
fn template_from(args: &BuildArgs) -> anyhow::Result<Template> {
    let mut template = Template::new();
    if is_template(&args.source) {
        template.load(&args.source).map_err(|e| {
            CommandFailure::data(format!(
                "Couldn't load template from '{}': {}",
                args.source.display(),
                e
            ))
        })?;
    } else if args.source.exists() {
        template.source_path = Some(args.source.clone());
    } else {
        return Err(CommandFailure::data(format!(
            "'{}' is not a valid installer, system image or template",
            args.source.display()
        ))
        .into());
    }

    if let Some(installer) = &args.installer {
        template.source_path = Some(installer.clone());
    }
    if let Some(output) = &args.output {
        template.output_path = Some(output.clone());
    }
    if let Some(name) = &args.name {
        template.volume_name = name.clone();
    }
    if args.size.is_some() {
        template.volume_size = args.size;
    }
    if args.updates {
        template.apply_updates = true;
    }
    for package in &args.packages {
        template.add_package(package).map_err(|e| {
            CommandFailure::data(format!("Additional packages failed verification: {}", e))
        })?;
    }
    Ok(template)
}

/// Remove an existing output with `force`, otherwise refuse it. Creates a
/// missing parent directory.
fn check_output(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() {
        if !force {
            return Err(CommandFailure::cant_create(format!("{} already exists", output.display())).into());
        }
        std::fs::remove_file(output).map_err(|e| {
            CommandFailure::cant_create(format!("Couldn't remove {}: {}", output.display(), e))
        })?;
    } else if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent).map_err(|e| {
            CommandFailure::cant_create(format!(
                "{} does not exist and can't be created: {}",
                parent.display(),
                e
            ))
        })?;
    }
    Ok(())
}

async fn read_password() -> anyhow::Result<String> {
    let mut line = String::new();
    tokio::io::BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

pub async fn execute(args: BuildArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let mut template = template_from(&args)?;
    let source_path = template
        .source_path
        .clone()
        .ok_or_else(|| CommandFailure::usage("No source path"))?;
    if template.output_path.is_none() {
        return Err(CommandFailure::usage("No output path").into());
    }
    tracing::info!("Installer: {}", source_path.display());

    let layout = global.layout()?;
    let mut options = BuildOptions::standard();
    if args.skip_asr_imagescan {
        options.with_finalize_scan(false);
    }
    let images = Arc::new(DiskImageManager::new(
        Arc::new(Hdiutil::default()),
        DetachPolicy::from(&options),
    ));

    let result = build(&args, &layout, options, Arc::clone(&images), &mut template, &source_path).await;

    for (image, error) in images.detach_all().await {
        tracing::error!("Failed to detach '{}': {}", image.display(), error);
    }
    result
}

async fn build(
    args: &BuildArgs,
    layout: &dmgsmith::FilesystemLayout,
    options: BuildOptions,
    images: Arc<DiskImageManager>,
    template: &mut Template,
    source_path: &Path,
) -> anyhow::Result<()> {
    tracing::info!("Examining source");
    let source = SourceInspector::new(Arc::clone(&images))
        .examine(source_path)
        .await
        .map_err(|e| CommandFailure::data(format!("Source failed: {}", e)))?;
    tracing::info!("Found installer: {} {} {}", source.name, source.version, source.build);

    template.resolve_variables(&HashMap::from([
        ("OSNAME".to_string(), source.name.clone()),
        ("OSVERSION".to_string(), source.version.clone()),
        ("OSBUILD".to_string(), source.build.clone()),
    ]));
    let output = template
        .output_path
        .clone()
        .ok_or_else(|| CommandFailure::usage("No output path"))?;
    tracing::info!("Output Path: {}", output.display());
    tracing::info!("Volume Name: {}", template.volume_name);

    let mut packages = Vec::new();
    if template.apply_updates {
        let profiles = load_profiles(layout, args.profiles.as_deref())?;
        let cache = open_cache(layout, &profiles)?;
        let mut missing = Vec::new();
        for update in profile(&profiles, &source.version, &source.build)? {
            tracing::info!("Update: {} ({})", update.name, format_bytes(update.size));
            let package = update_package(&cache, update);
            if !cache.is_cached(&update.sha1) {
                if !args.download_updates {
                    return Err(CommandFailure::data(format!(
                        "Can't apply updates, {} is missing from cache",
                        update.name
                    ))
                    .into());
                }
                missing.push(package.clone());
            }
            packages.push(package);
        }

        if !missing.is_empty() {
            download_updates(Arc::clone(&cache), missing, Arc::new(HttpFetcher::new()?))
                .await
                .map_err(|e| {
                    tracing::error!("{:#}", e);
                    CommandFailure::failure("Can't build due to updates missing from cache")
                })?;
            tracing::info!("All updates for {} {} downloaded", source.version, source.build);
        }
    }

    for path in &template.additional_packages {
        let package = Package::from_path(path).map_err(|e| CommandFailure::data(e.to_string()))?;
        tracing::info!("Package: {} ({})", package.name(), format_bytes(package.size_bytes()));
        packages.push(package);
    }

    check_output(&output, args.force)?;

    let password = if args.password_stdin {
        Some(read_password().await?)
    } else {
        None
    };
    let elevation = Elevation::resolve(ElevationPolicy::Auto, password)?;
    tracing::debug!(elevation = ?elevation, "Selected elevation");

    let services = BuildServices {
        images,
        launcher: Arc::new(PrivilegedExecutor::new(elevation)),
        sizer: Arc::new(PackageSizer::new(options.heuristic_size_factor)),
    };
    let scheduler = BuildScheduler::new(
        options,
        services,
        Arc::new(ConsoleObserver::default()),
        layout.tmp_dir(),
    );
    let request = BuildRequest {
        source,
        output_path: output,
        volume_name: template.volume_name.clone(),
        volume_size_gb: template.volume_size,
        packages,
        template: template.clone(),
    };

    let handle = scheduler.start(request);
    let cancel = handle.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping build");
            cancel.cancel();
        }
    });
    let outcome = handle.wait().await;
    interrupt.abort();

    match outcome? {
        BuildOutcome::Succeeded { .. } => Ok(()),
        BuildOutcome::Failed { message, details } => {
            Err(CommandFailure::failure(format!("Build failed: {}\n    {}", message, details)).into())
        }
        BuildOutcome::Cancelled => Err(CommandFailure::failure("Build cancelled").into()),
    }
}

// ============================================================================
// PROGRESS OUTPUT
// ============================================================================

#[derive(Default)]
struct ProgressState {
    total: u64,
    last_percent: Option<f64>,
    last_message: String,
}

/// Logs build events, throttling progress to changes of at least 0.1%.
#[derive(Default)]
struct ConsoleObserver {
    state: Mutex<ProgressState>,
}

impl BuildObserver for ConsoleObserver {
    fn build_starting(&self, output: &Path) {
        tracing::info!("Building {}", output.display());
        let mut state = self.state.lock();
        state.last_percent = None;
    }

    fn set_total_weight(&self, total: u64) {
        self.state.lock().total = total;
    }

    fn set_phase(&self, phase: &str) {
        tracing::info!("phase: {}", phase);
    }

    fn set_progress(&self, progress: f64) {
        let mut state = self.state.lock();
        if state.total == 0 {
            return;
        }
        let percent = 100.0 * progress / state.total as f64;
        if state.last_percent.is_none_or(|last| (percent - last).abs() >= 0.1) {
            tracing::info!("progress: {:.1}%", percent);
            state.last_percent = Some(percent);
        }
    }

    fn set_progress_message(&self, message: &str) {
        let mut state = self.state.lock();
        if state.last_message != message {
            tracing::info!("message: {}", message);
            state.last_message = message.to_string();
        }
    }

    fn build_succeeded(&self) {
        tracing::info!("Build successful");
    }

    fn build_failed(&self, message: &str, details: &str) {
        tracing::error!("Build failed: {}", message);
        tracing::error!("    {}", details);
    }

    fn build_stopped(&self) {
        tracing::debug!("Build stopped");
    }

    fn detach_failed(&self, image: &Path, message: &str) {
        tracing::error!("Failed to detach '{}': {}", image.display(), message);
    }
}
