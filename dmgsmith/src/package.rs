use std::path::{Path, PathBuf};

use dmgsmith_shared::errors::BuildResult;

use crate::util::on_disk_size;

/// A package to install into the image: either supplied locally or resolved
/// from the update cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Package {
    name: String,
    path: PathBuf,
    size_bytes: u64,
    url: Option<String>,
    sha1: Option<String>,
}

impl Package {
    /// A locally supplied package, sized by what it occupies on disk.
    pub fn from_path(path: &Path) -> BuildResult<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self {
            name,
            path: path.to_path_buf(),
            size_bytes: on_disk_size(path)?,
            url: None,
            sha1: None,
        })
    }

    /// An update with a known download location and digest. `path` is where
    /// it lives (or will live) in the cache.
    pub fn update(name: String, path: PathBuf, size_bytes: u64, url: String, sha1: String) -> Self {
        Self {
            name,
            path,
            size_bytes,
            url: Some(url),
            sha1: Some(sha1.to_ascii_lowercase()),
        }
    }

    pub fn new(name: String, path: PathBuf, size_bytes: u64) -> Self {
        Self {
            name,
            path,
            size_bytes,
            url: None,
            sha1: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn sha1(&self) -> Option<&str> {
        self.sha1.as_deref()
    }

    /// Same package at another location, e.g. inside a mounted image.
    pub fn with_path(&self, path: PathBuf) -> Self {
        Self {
            path,
            ..self.clone()
        }
    }
}
