//! Installed-size estimation for packages and applications.
//!
//! Strategies, most accurate first:
//!
//! 1. `installer -pkginfo` size query
//! 2. size metadata declared inside the package
//! 3. a multiple of the on-disk size
//!
//! The strategy that produced a number is returned with it, so callers can
//! tell a measured size from a guess.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use dmgsmith_shared::errors::{BuildError, BuildResult};
use regex::Regex;
use serde::Deserialize;

use crate::constants::tools;
use crate::util::{format_bytes, on_disk_size, run_tool};

static PKG_REF_KBYTES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<pkg-ref\b[^>]*?\binstallKBytes\s*=\s*["'](\d+)["']"#).expect("valid regex")
});

static PAYLOAD_KBYTES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<payload\b[^>]*?\binstallKBytes\s*=\s*["'](\d+)["']"#).expect("valid regex")
});

/// Where an estimate came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeStrategy {
    /// Applications: what the bundle occupies now.
    OnDisk,
    InstallerQuery,
    PackageMetadata,
    /// Last resort multiple of the on-disk size.
    Heuristic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeEstimate {
    pub bytes: u64,
    pub strategy: SizeStrategy,
}

impl SizeEstimate {
    pub fn is_heuristic(&self) -> bool {
        self.strategy == SizeStrategy::Heuristic
    }
}

#[async_trait]
pub trait SizeEstimator: Send + Sync {
    async fn estimate(&self, path: &Path) -> BuildResult<SizeEstimate>;
}

// ============================================================================
// PACKAGE SIZER
// ============================================================================

#[derive(Clone, Debug)]
pub struct PackageSizer {
    installer: String,
    xar: String,
    heuristic_factor: u64,
}

impl PackageSizer {
    pub fn new(heuristic_factor: u64) -> Self {
        Self {
            installer: tools::INSTALLER.to_string(),
            xar: tools::XAR.to_string(),
            heuristic_factor,
        }
    }

    /// Use other `installer` and `xar` programs.
    pub fn with_tools(mut self, installer: impl Into<String>, xar: impl Into<String>) -> Self {
        self.installer = installer.into();
        self.xar = xar.into();
        self
    }

    async fn query_installer(&self, pkg: &Path) -> Option<u64> {
        #[derive(Deserialize)]
        struct PkgInfo {
            #[serde(rename = "Size")]
            size: u64,
        }

        // installer is picky about the paths it accepts; hand it a plain
        // symlink in a private directory.
        let tempdir = tempfile::tempdir().ok()?;
        let link = tempdir.path().join(pkg.file_name()?);
        std::os::unix::fs::symlink(pkg, &link).ok()?;

        let args = [
            "-pkginfo",
            "-verbose",
            "-plist",
            "-pkg",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain(std::iter::once(link.display().to_string()))
        .collect::<Vec<_>>();

        let output = match run_tool(&self.installer, &args, None).await {
            Ok(output) if output.success() => output,
            Ok(output) => {
                tracing::debug!(status = output.status, "{} failed to determine size requirements", self.installer);
                return None;
            }
            Err(e) => {
                tracing::debug!("{}", e);
                return None;
            }
        };

        match plist::from_bytes::<PkgInfo>(&output.stdout) {
            Ok(info) => {
                let bytes = info.size * 1024;
                tracing::debug!("Installer says {} requires {}", pkg.display(), format_bytes(bytes));
                Some(bytes)
            }
            Err(e) => {
                tracing::error!("Error decoding plist: {}", e);
                None
            }
        }
    }

    async fn read_metadata(&self, pkg: &Path) -> Option<u64> {
        if pkg.is_dir() {
            bundle_pkg_size(pkg)
        } else {
            self.flat_pkg_size(pkg).await
        }
    }

    async fn flat_pkg_size(&self, pkg: &Path) -> Option<u64> {
        let tempdir = tempfile::tempdir().ok()?;
        let args: Vec<String> = vec![
            "-x".into(),
            "--exclude".into(),
            "^[^DP]".into(),
            "--exclude".into(),
            "Payload".into(),
            "-C".into(),
            tempdir.path().display().to_string(),
            "-f".into(),
            pkg.display().to_string(),
        ];
        match run_tool(&self.xar, &args, None).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                tracing::error!("xar failed with return code {}", output.status);
                return None;
            }
            Err(e) => {
                tracing::error!("{}", e);
                return None;
            }
        }

        let distribution = tempdir.path().join("Distribution");
        let package_info = tempdir.path().join("PackageInfo");
        if distribution.exists() {
            sum_kbytes(&distribution, &PKG_REF_KBYTES)
        } else if package_info.exists() {
            sum_kbytes(&package_info, &PAYLOAD_KBYTES)
        } else {
            tracing::error!("No Distribution or PackageInfo found in '{}'", pkg.display());
            None
        }
    }
}

#[async_trait]
impl SizeEstimator for PackageSizer {
    async fn estimate(&self, path: &Path) -> BuildResult<SizeEstimate> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "app" => Ok(SizeEstimate {
                bytes: on_disk_size(path)?,
                strategy: SizeStrategy::OnDisk,
            }),
            "pkg" | "mpkg" => {
                if let Some(bytes) = self.query_installer(path).await {
                    return Ok(SizeEstimate {
                        bytes,
                        strategy: SizeStrategy::InstallerQuery,
                    });
                }
                if let Some(bytes) = self.read_metadata(path).await {
                    tracing::debug!("{} needs {}", path.display(), format_bytes(bytes));
                    return Ok(SizeEstimate {
                        bytes,
                        strategy: SizeStrategy::PackageMetadata,
                    });
                }
                tracing::warn!("Estimating package size for '{}'", path.display());
                let bytes = on_disk_size(path)? * self.heuristic_factor;
                Ok(SizeEstimate {
                    bytes,
                    strategy: SizeStrategy::Heuristic,
                })
            }
            _ => Err(BuildError::Config(format!(
                "Don't know how to calculate installed size for '{}'",
                path.display()
            ))),
        }
    }
}

fn bundle_pkg_size(pkg: &Path) -> Option<u64> {
    #[derive(Deserialize)]
    struct BundleInfo {
        #[serde(rename = "IFPkgFlagInstalledSize")]
        installed_size: u64,
    }

    let contents: PathBuf = pkg.join("Contents");
    let distribution = contents.join("distribution.dist");
    let info_plist = contents.join("Info.plist");
    if distribution.exists() {
        sum_kbytes(&distribution, &PKG_REF_KBYTES)
    } else if info_plist.exists() {
        match plist::from_file::<_, BundleInfo>(&info_plist) {
            Ok(info) => Some(info.installed_size * 1024),
            Err(e) => {
                tracing::error!("Failed parsing '{}': {}", info_plist.display(), e);
                None
            }
        }
    } else {
        tracing::error!("No distribution.dist or Info.plist found in '{}'", pkg.display());
        None
    }
}

/// Sum the `installKBytes` attributes `pattern` matches in an XML document,
/// in bytes.
fn sum_kbytes(path: &Path, pattern: &Regex) -> Option<u64> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("Failed parsing '{}': {}", path.display(), e);
            return None;
        }
    };
    let kbytes: u64 = pattern
        .captures_iter(&text)
        .filter_map(|c| c[1].parse::<u64>().ok())
        .sum();
    Some(kbytes * 1024)
}
