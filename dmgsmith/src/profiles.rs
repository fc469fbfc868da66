//! Update profiles: which updates bring a given OS build up to date.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use dmgsmith_shared::errors::{BuildError, BuildResult};
use serde::{Deserialize, Serialize};

use crate::cache::{friendly_name, validate_sha1};

/// One downloadable update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub name: String,
    pub url: String,
    pub sha1: String,
    /// Download size in bytes.
    #[serde(default)]
    pub size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ProfilesFile {
    #[serde(rename = "PublicationDate")]
    publication_date: plist::Date,
    /// `"<version>-<build>"` → update keys.
    #[serde(rename = "Profiles")]
    profiles: HashMap<String, Vec<String>>,
    #[serde(rename = "Updates")]
    updates: HashMap<String, Update>,
    /// Replacement `"<version>-<build>"` → deprecated builds.
    #[serde(rename = "DeprecatedInstallers", default)]
    deprecated_installers: HashMap<String, Vec<String>>,
}

#[derive(Clone, Debug)]
pub struct UpdateProfiles {
    file: ProfilesFile,
    /// Profile key → resolved updates.
    profiles: HashMap<String, Vec<Update>>,
    /// Deprecated build → replacement.
    deprecated: HashMap<String, String>,
}

impl UpdateProfiles {
    pub fn load(path: &Path) -> BuildResult<Self> {
        let file: ProfilesFile = plist::from_file(path).map_err(|e| {
            BuildError::Config(format!("Failed to load {}: {}", path.display(), e))
        })?;
        Self::from_file(file)
    }

    pub fn from_bytes(bytes: &[u8]) -> BuildResult<Self> {
        let file: ProfilesFile = plist::from_bytes(bytes)
            .map_err(|e| BuildError::Config(format!("Failed to parse update profiles: {}", e)))?;
        Self::from_file(file)
    }

    fn from_file(file: ProfilesFile) -> BuildResult<Self> {
        tracing::info!(
            "Loading update profiles with PublicationDate {}",
            file.publication_date.to_xml_format()
        );

        for (key, update) in &file.updates {
            validate_sha1(&update.sha1).map_err(|_| {
                BuildError::Config(format!(
                    "Update {} has an invalid sha1 digest {:?}",
                    key, update.sha1
                ))
            })?;
        }

        let mut profiles = HashMap::new();
        for (key, names) in &file.profiles {
            let updates = names
                .iter()
                .map(|name| {
                    file.updates.get(name).cloned().ok_or_else(|| {
                        BuildError::Config(format!(
                            "Profile {} references unknown update {}",
                            key, name
                        ))
                    })
                })
                .collect::<BuildResult<Vec<_>>>()?;
            profiles.insert(key.clone(), updates);
        }

        let deprecated = file
            .deprecated_installers
            .iter()
            .flat_map(|(replacement, builds)| {
                builds.iter().map(move |b| (b.clone(), replacement.clone()))
            })
            .collect::<HashMap<_, _>>();
        if deprecated.is_empty() {
            tracing::debug!("No deprecated installers");
        }

        Ok(Self {
            file,
            profiles,
            deprecated,
        })
    }

    pub fn publication_date(&self) -> std::time::SystemTime {
        self.file.publication_date.into()
    }

    pub fn is_newer_than(&self, other: &UpdateProfiles) -> bool {
        self.publication_date() > other.publication_date()
    }

    /// Write the profiles as an XML property list.
    pub fn save(&self, path: &Path) -> BuildResult<()> {
        tracing::info!(
            "Saving update profiles with PublicationDate {}",
            self.file.publication_date.to_xml_format()
        );
        plist::to_file_xml(path, &self.file)
            .map_err(|e| BuildError::Storage(format!("Failed to write {}: {}", path.display(), e)))
    }

    /// Updates for an OS version and build, in install order.
    pub fn profile_for(&self, version: &str, build: &str) -> Option<&[Update]> {
        let profile = self.profiles.get(&format!("{}-{}", version, build));
        match profile {
            Some(updates) => tracing::info!(
                "Update profile for {} {}: {}",
                version,
                build,
                updates.iter().map(|u| u.name.as_str()).collect::<Vec<_>>().join(", ")
            ),
            None => tracing::info!("No update profile for {} {}", version, build),
        }
        profile.map(Vec::as_slice)
    }

    /// Every known update, sha1 → friendly cache name.
    pub fn update_paths(&self) -> HashMap<String, String> {
        self.file
            .updates
            .values()
            .map(|u| (u.sha1.to_ascii_lowercase(), friendly_name(&u.url, &u.sha1)))
            .collect()
    }

    /// Best guess at why `version`/`build` has no profile.
    pub fn why_no_profile(&self, version: &str, build: &str) -> String {
        if let Some(replacement) = self.deprecated.get(build) {
            let (v, b) = replacement.split_once('-').unwrap_or((replacement, ""));
            return format!("Installer deprecated by {} {}", v, b);
        }

        let wanted = split_version(version);
        let wanted_major = major_of(&wanted);
        let wanted_point = wanted.get(2).copied();

        let mut known_versions = BTreeSet::new();
        let mut points = BTreeSet::new();
        let mut supported = false;
        for key in self.profiles.keys() {
            let (v, _) = key.split_once('-').unwrap_or((key, ""));
            known_versions.insert(v.to_string());
            let parts = split_version(v);
            if major_of(&parts) == wanted_major {
                supported = true;
                points.insert(parts.get(2).copied().unwrap_or(0));
            }
        }

        if !supported {
            return format!("{}.{} is not supported", wanted_major.0, wanted_major.1);
        }
        if known_versions.contains(version) {
            return format!("Unknown build {}", build);
        }
        let oldest = points.first().copied().unwrap_or(0);
        let newest = points.last().copied().unwrap_or(0);
        match wanted_point {
            None => "Deprecated installer".to_string(),
            Some(p) if p < oldest => "Deprecated installer".to_string(),
            Some(p) if p > newest => "Installer newer than update profile".to_string(),
            Some(_) => format!("Unknown {} installer", version),
        }
    }
}

fn split_version(version: &str) -> Vec<u32> {
    version
        .split('.')
        .map(|part| part.trim().parse().unwrap_or(0))
        .collect()
}

fn major_of(parts: &[u32]) -> (u32, u32) {
    (
        parts.first().copied().unwrap_or(0),
        parts.get(1).copied().unwrap_or(0),
    )
}
