//! Installer source inspection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dmgsmith_shared::errors::{BuildError, BuildResult};
use serde::Deserialize;

use crate::constants::media;
use crate::disk::DiskImageManager;

/// What a source image contains.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Installer media; the OS is installed from `Packages/OSInstall.mpkg`.
    InstallEsd,
    /// A prebuilt system image used as the base of the new image.
    SystemImage,
}

/// An examined, accepted source.
#[derive(Clone, Debug)]
pub struct SourceInfo {
    /// Path as given by the user.
    pub path: PathBuf,
    /// The image that was attached: InstallESD.dmg inside an installer app,
    /// otherwise `path`.
    pub image_path: PathBuf,
    pub mount_point: PathBuf,
    pub kind: SourceKind,
    pub name: String,
    pub version: String,
    pub build: String,
    /// Template left in a previously built image, if any.
    pub embedded_template: Option<PathBuf>,
}

impl SourceInfo {
    /// Path of the OS install package, for installer media.
    pub fn os_install_package(&self) -> Option<PathBuf> {
        match self.kind {
            SourceKind::InstallEsd => Some(self.mount_point.join(media::OS_INSTALL_PKG)),
            SourceKind::SystemImage => None,
        }
    }
}

#[derive(Deserialize)]
struct SystemVersion {
    #[serde(rename = "ProductName")]
    name: String,
    #[serde(rename = "ProductUserVisibleVersion")]
    user_visible_version: Option<String>,
    #[serde(rename = "ProductVersion")]
    version: Option<String>,
    #[serde(rename = "ProductBuildVersion")]
    build: String,
}

/// Read `System/Library/CoreServices/SystemVersion.plist` below `root`.
/// Returns `(name, version, build)`.
pub fn read_system_version(root: &Path) -> BuildResult<(String, String, String)> {
    let path = root.join(media::SYSTEM_VERSION);
    let sv: SystemVersion = plist::from_file(&path).map_err(|e| {
        BuildError::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let version = sv
        .user_visible_version
        .or(sv.version)
        .ok_or_else(|| BuildError::Config(format!("No product version in {}", path.display())))?;
    Ok((sv.name, version, sv.build))
}

pub struct SourceInspector {
    images: Arc<DiskImageManager>,
}

impl SourceInspector {
    pub fn new(images: Arc<DiskImageManager>) -> Self {
        Self { images }
    }

    /// Attach `path` (or the InstallESD.dmg inside it), classify it and read
    /// its OS version.
    ///
    /// Installer media stays attached for the build; a system image is
    /// detached again once examined.
    pub async fn examine(&self, path: &Path) -> BuildResult<SourceInfo> {
        let esd = path.join(media::INSTALL_ESD);
        let image_path = if esd.exists() { esd } else { path.to_path_buf() };

        tracing::info!(source = %path.display(), "Examining source");
        let mount_point = self.images.attach(&image_path).await.map_err(|e| {
            BuildError::Mount(format!("Failed to mount {}: {}", image_path.display(), e))
        })?;

        let kind = if mount_point.join(media::OS_INSTALL_PKG).exists() {
            SourceKind::InstallEsd
        } else {
            SourceKind::SystemImage
        };
        tracing::debug!(?kind, "Classified source");

        let (name, version, build) = self.find_system_version(&mount_point).await?;
        tracing::info!("Found source: {} {} {}", name, version, build);

        let info = SourceInfo {
            path: path.to_path_buf(),
            embedded_template: find_embedded_template(&mount_point),
            image_path,
            mount_point,
            kind,
            name,
            version,
            build,
        };

        if kind == SourceKind::SystemImage
            && let Err(e) = self.images.detach(&info.image_path).await
        {
            tracing::warn!("Failed to eject {}: {}", info.image_path.display(), e);
        }

        Ok(info)
    }

    async fn find_system_version(&self, mount_point: &Path) -> BuildResult<(String, String, String)> {
        if mount_point.join(media::SYSTEM_VERSION).exists() {
            return read_system_version(mount_point);
        }

        let base_system = mount_point.join(media::BASE_SYSTEM);
        if !base_system.exists() {
            return Err(invalid_source());
        }

        let base_mount = self.images.attach(&base_system).await.map_err(|e| {
            BuildError::Mount(format!("Failed to mount {}: {}", base_system.display(), e))
        })?;
        let version = if base_mount.join(media::SYSTEM_VERSION).exists() {
            read_system_version(&base_mount)
        } else {
            Err(invalid_source())
        };
        if let Err(e) = self.images.detach(&base_system).await {
            tracing::warn!("Failed to eject {}: {}", base_system.display(), e);
        }
        version
    }
}

fn invalid_source() -> BuildError {
    BuildError::Config("Invalid source: Couldn't find system version.".to_string())
}

fn find_embedded_template(mount_point: &Path) -> Option<PathBuf> {
    let log_dir = mount_point.join("private/var/log");
    std::fs::read_dir(log_dir)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .find(|p| p.extension().is_some_and(|ext| ext == "adtmpl"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_system_version(root: &Path, version_key: &str) {
        let path = root.join(media::SYSTEM_VERSION);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            path,
            format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict>
<key>ProductName</key><string>Mac OS X</string>
<key>{}</key><string>10.11.6</string>
<key>ProductBuildVersion</key><string>15G31</string>
</dict></plist>"#,
                version_key
            ),
        )
        .unwrap();
    }

    #[test]
    fn prefers_user_visible_version() {
        let temp = tempfile::tempdir().unwrap();
        write_system_version(temp.path(), "ProductUserVisibleVersion");
        assert_eq!(
            read_system_version(temp.path()).unwrap(),
            ("Mac OS X".to_string(), "10.11.6".to_string(), "15G31".to_string())
        );
    }

    #[test]
    fn falls_back_to_product_version() {
        let temp = tempfile::tempdir().unwrap();
        write_system_version(temp.path(), "ProductVersion");
        assert_eq!(read_system_version(temp.path()).unwrap().1, "10.11.6");
    }

    #[test]
    fn finds_embedded_template() {
        let temp = tempfile::tempdir().unwrap();
        let log_dir = temp.path().join("private/var/log");
        std::fs::create_dir_all(&log_dir).unwrap();
        std::fs::write(log_dir.join("install.log"), b"").unwrap();
        std::fs::write(log_dir.join("AutoBuild-161012.adtmpl"), b"").unwrap();

        assert_eq!(
            find_embedded_template(temp.path()),
            Some(log_dir.join("AutoBuild-161012.adtmpl"))
        );
    }
}
