use crate::constants::envs;
use dmgsmith_shared::errors::{BuildError, BuildResult};
use std::path::{Path, PathBuf};

/// Directory structure constants
pub mod dirs {
    /// Base directory name under the user's home
    pub const DMGSMITH_DIR: &str = ".dmgsmith";

    /// Content-addressed update cache
    pub const UPDATES_DIR: &str = "Updates";

    /// Subdirectory for log files
    pub const LOGS_DIR: &str = "logs";

    /// Scratch space for per-build temp directories and sockets
    pub const TMP_DIR: &str = "tmp";

    pub const PROFILES_FILE: &str = "UpdateProfiles.plist";
}

// ============================================================================
// FILESYSTEM LAYOUT (home directory)
// ============================================================================

/// Paths under the dmgsmith home directory.
///
/// ```text
/// ~/.dmgsmith/
///   Updates/              sha1-named payloads + friendly-name symlinks
///   logs/                 helper log files
///   tmp/                  per-build scratch directories
///   UpdateProfiles.plist
/// ```
#[derive(Clone, Debug)]
pub struct FilesystemLayout {
    home_dir: PathBuf,
}

impl FilesystemLayout {
    pub fn new(home_dir: PathBuf) -> Self {
        Self { home_dir }
    }

    /// Resolve the home directory from `$DMGSMITH_HOME`, falling back to
    /// `~/.dmgsmith`.
    pub fn from_env() -> BuildResult<Self> {
        if let Ok(home) = std::env::var(envs::DMGSMITH_HOME) {
            return Ok(Self::new(PathBuf::from(home)));
        }
        let user_home = ::dirs::home_dir().ok_or_else(|| {
            BuildError::Config(format!(
                "Cannot determine home directory; set {}",
                envs::DMGSMITH_HOME
            ))
        })?;
        Ok(Self::new(user_home.join(dirs::DMGSMITH_DIR)))
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn updates_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::UPDATES_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::LOGS_DIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::TMP_DIR)
    }

    pub fn profiles_path(&self) -> PathBuf {
        self.home_dir.join(dirs::PROFILES_FILE)
    }

    /// Create every directory of the layout.
    pub fn prepare(&self) -> BuildResult<()> {
        for dir in [self.updates_dir(), self.logs_dir(), self.tmp_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                BuildError::Storage(format!(
                    "Failed to create directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}
