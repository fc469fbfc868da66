pub mod build;
pub mod download;
pub mod list;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dmgsmith::cache::{DownloadEvent, Fetcher, UpdateCache, download_all};
use dmgsmith::layout::FilesystemLayout;
use dmgsmith::util::format_bytes;
use dmgsmith::{Package, Update, UpdateProfiles};

/// Process exit statuses, sysexits style.
pub mod status {
    pub const FAILURE: u8 = 1;
    pub const USAGE: u8 = 64;
    pub const DATA_ERROR: u8 = 65;
    pub const CANT_CREATE: u8 = 73;
}

/// A command error that decides the exit status.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct CommandFailure {
    pub status: u8,
    pub message: String,
}

impl CommandFailure {
    pub fn new(status: u8, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::new(status::USAGE, message)
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::new(status::DATA_ERROR, message)
    }

    pub fn cant_create(message: impl Into<String>) -> Self {
        Self::new(status::CANT_CREATE, message)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(status::FAILURE, message)
    }
}

/// Load the update profiles from `path`, or from the home directory.
pub fn load_profiles(layout: &FilesystemLayout, path: Option<&Path>) -> anyhow::Result<UpdateProfiles> {
    let path = path.map_or_else(|| layout.profiles_path(), Path::to_path_buf);
    if !path.is_file() {
        return Err(CommandFailure::data(format!("No update profiles found at {}", path.display())).into());
    }
    UpdateProfiles::load(&path).map_err(|e| CommandFailure::data(e.to_string()).into())
}

/// Open the update cache and bring it in line with `profiles`.
pub fn open_cache(layout: &FilesystemLayout, profiles: &UpdateProfiles) -> anyhow::Result<Arc<UpdateCache>> {
    let cache = UpdateCache::new(layout.updates_dir())?;
    cache.prune_and_link(&profiles.update_paths())?;
    Ok(Arc::new(cache))
}

/// Updates for `version`/`build`, or the reason there are none.
pub fn profile<'a>(profiles: &'a UpdateProfiles, version: &str, build: &str) -> anyhow::Result<&'a [Update]> {
    profiles
        .profile_for(version, build)
        .ok_or_else(|| CommandFailure::data(profiles.why_no_profile(version, build)).into())
}

pub fn update_package(cache: &UpdateCache, update: &Update) -> Package {
    Package::update(
        update.name.clone(),
        cache.cache_path(&update.sha1),
        update.size,
        update.url.clone(),
        update.sha1.clone(),
    )
}

/// Download `packages`, logging progress in steps of 10% or once a second.
pub async fn download_updates(
    cache: Arc<UpdateCache>,
    packages: Vec<Package>,
    fetcher: Arc<dyn Fetcher>,
) -> anyhow::Result<()> {
    let sizes: HashMap<String, u64> = packages
        .iter()
        .map(|p| (p.name().to_string(), p.size_bytes()))
        .collect();
    let mut rx = download_all(cache, packages, fetcher);

    let mut last_percent = -100.0_f64;
    let mut last_logged = Instant::now();
    let mut failure = None;

    while let Some(event) = rx.recv().await {
        match event {
            DownloadEvent::Starting { package } => {
                let size = sizes.get(&package).copied().unwrap_or(0);
                tracing::info!("Downloading {} ({})", package, format_bytes(size));
                last_percent = -100.0;
                last_logged = Instant::now();
            }
            DownloadEvent::Data {
                package,
                bytes_received,
            } => {
                let size = sizes.get(&package).copied().unwrap_or(0);
                if size == 0 {
                    continue;
                }
                let percent = 100.0 * bytes_received as f64 / size as f64;
                if (percent - last_percent).abs() >= 10.0
                    || last_logged.elapsed() >= Duration::from_secs(1)
                    || bytes_received == size
                {
                    tracing::info!("progress: {:.1}%", percent);
                    last_percent = percent;
                    last_logged = Instant::now();
                }
            }
            DownloadEvent::Checksumming { package } => {
                tracing::debug!(package = %package, "Verifying download");
            }
            DownloadEvent::ChecksumOk { package, .. } => {
                tracing::debug!(package = %package, "Download verified");
            }
            DownloadEvent::Failed { package, message } => {
                tracing::error!("Download of {} failed: {}", package, message);
                failure = Some(format!("Download of {} failed: {}", package, message));
            }
            DownloadEvent::AllDone => break,
            DownloadEvent::Response { .. } | DownloadEvent::ChecksumProgress { .. } => {}
        }
    }

    match failure {
        Some(message) => Err(CommandFailure::failure(message).into()),
        None => Ok(()),
    }
}
