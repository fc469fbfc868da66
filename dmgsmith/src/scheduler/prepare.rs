//! The Prepare task: resolve what gets installed and how large the output
//! image must be.
//!
//! Runs on a worker task and only reads the request; the result is handed
//! back to the scheduler, which owns all build state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;

use super::Failure;
use crate::constants::sizing;
use crate::disk::DiskImageManager;
use crate::options::BuildOptions;
use crate::package::Package;
use crate::sizing::SizeEstimator;
use crate::source::SourceInfo;
use crate::util::format_bytes;

/// Outcome of a successful Prepare task.
#[derive(Debug)]
pub(crate) struct Prepared {
    /// Paths handed to the install helper, OS package first.
    pub install_paths: Vec<PathBuf>,
    pub volume_size_gb: u64,
}

pub(crate) struct PrepareContext {
    pub images: Arc<DiskImageManager>,
    pub sizer: Arc<dyn SizeEstimator>,
    pub options: BuildOptions,
}

pub(crate) fn is_disk_image(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "dmg")
}

/// Installable items at the top of a mounted package image: `.mpkg` first,
/// then `.pkg`, then `.app`, each sorted by name.
fn installables_in(mount_point: &Path) -> Vec<PathBuf> {
    let entries: Vec<PathBuf> = match std::fs::read_dir(mount_point) {
        Ok(dir) => dir.flatten().map(|e| e.path()).collect(),
        Err(e) => {
            tracing::warn!(mount_point = %mount_point.display(), "Failed to list image contents: {}", e);
            return Vec::new();
        }
    };
    tracing::debug!(mount_point = %mount_point.display(), ?entries, "Looking for packages and applications");

    let mut found = Vec::new();
    for ext in ["mpkg", "pkg", "app"] {
        let mut matching: Vec<PathBuf> = entries
            .iter()
            .filter(|p| p.extension().is_some_and(|e| e == ext))
            .cloned()
            .collect();
        matching.sort();
        found.extend(matching);
    }
    found
}

/// Attach package images, pick what to install and size the output image.
///
/// Images attached here stay attached for the install helper; the scheduler
/// detaches them at teardown.
pub(crate) async fn run(
    ctx: PrepareContext,
    source: SourceInfo,
    packages: Vec<Package>,
    volume_size_gb: Option<u64>,
) -> Result<Prepared, Failure> {
    let package_images: Vec<PathBuf> = packages
        .iter()
        .map(|p| p.path().to_path_buf())
        .filter(|p| is_disk_image(p))
        .collect();
    let attach_results = join_all(package_images.into_iter().map(|path| {
        let images = Arc::clone(&ctx.images);
        async move {
            tracing::info!(image = %path.display(), "Attaching package image");
            let result = images.attach(&path).await;
            (path, result)
        }
    }))
    .await;

    let mut mounts = HashMap::new();
    for (path, result) in attach_results {
        match result {
            Ok(mount_point) => {
                mounts.insert(path, mount_point);
            }
            Err(e) => {
                return Err(Failure::new(
                    format!("Failed to attach {}", path.display()),
                    e.to_string(),
                ));
            }
        }
    }

    let (install_paths, volume_size_gb) =
        resolve(&ctx, &source, &packages, &mounts, volume_size_gb).await?;
    Ok(Prepared {
        install_paths,
        volume_size_gb,
    })
}

async fn resolve(
    ctx: &PrepareContext,
    source: &SourceInfo,
    packages: &[Package],
    mounts: &HashMap<PathBuf, PathBuf>,
    volume_size_gb: Option<u64>,
) -> Result<(Vec<PathBuf>, u64), Failure> {
    let mut install_paths: Vec<PathBuf> = source.os_install_package().into_iter().collect();

    for package in packages {
        let Some(mount_point) = mounts.get(package.path()) else {
            install_paths.push(package.path().to_path_buf());
            continue;
        };
        let found = installables_in(mount_point);
        let Some(first) = found.first() else {
            return Err(Failure::new(
                "Nothing found to install",
                format!("No package or application found in {}", package.name()),
            ));
        };
        if found.len() > 1 {
            tracing::warn!(
                "Multiple items found in {}, using {}",
                package.path().display(),
                first.display()
            );
        }
        install_paths.push(first.clone());
    }

    if install_paths.is_empty() {
        return Err(Failure::new("Nothing to do", "There are no packages to install"));
    }

    tracing::info!("{} packages to install:", install_paths.len());
    let mut required: u64 = 0;
    let mut estimated = Vec::new();
    for path in &install_paths {
        tracing::info!("    {}", path.display());
        let estimate = ctx.sizer.estimate(path).await.map_err(|e| {
            tracing::error!(path = %path.display(), "Size estimation failed: {}", e);
            Failure::new(
                "Failed to determine installed size",
                format!(
                    "Unable to determine installation size requirements for {}",
                    path.display()
                ),
            )
        })?;
        tracing::info!(
            path = %path.display(),
            strategy = ?estimate.strategy,
            "Installed size {}",
            format_bytes(estimate.bytes)
        );
        if estimate.is_heuristic() {
            estimated.push(path.display().to_string());
        }
        required += estimate.bytes;
    }
    if !estimated.is_empty() {
        tracing::warn!(
            "Installed size of {} is a rough estimate, the image may be larger than needed",
            estimated.join(", ")
        );
    }

    let required_str = format_bytes(required);
    tracing::info!("Workflow requires a {} disk image", required_str);

    let size = match volume_size_gb {
        None => ctx.options.default_volume_size_gb(required),
        Some(size) => {
            if required as f64 > size as f64 * sizing::BYTES_PER_GB {
                return Err(Failure::new(
                    "Disk image too small for workflow",
                    format!(
                        "Workflow requires {} and disk image is {} GB",
                        required_str, size
                    ),
                ));
            }
            size
        }
    };
    tracing::info!("Using a {} GB disk image", size);
    Ok((install_paths, size))
}
