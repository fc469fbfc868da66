//! Content-addressed update storage.
//!
//! Layout of the cache directory:
//!
//! ```text
//! Updates/
//!   3f1c...e9          payload, named by its sha1
//!   3f1c...e9.part     in-progress download (never trusted)
//!   Update(3f1c5a2).pkg -> 3f1c...e9
//! ```
//!
//! Does NOT handle:
//! - Network transfer (the downloader's responsibility)
//! - Deciding which updates a build needs (update profiles' responsibility)

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use dmgsmith_shared::errors::{BuildError, BuildResult};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Bytes hashed per read during verification.
const HASH_CHUNK: usize = 1024 * 1024;

/// Human readable cache name for an update: `<stem>(<sha1[..7]>)<.ext>` from
/// the last path segment of its URL.
pub fn friendly_name(url: &str, sha1: &str) -> String {
    let basename = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .rsplit('/')
        .next()
        .unwrap_or(url);
    let (stem, ext) = match basename.rfind('.') {
        Some(dot) if dot > 0 => basename.split_at(dot),
        _ => (basename, ""),
    };
    let short = sha1.char_indices().nth(7).map_or(sha1, |(end, _)| &sha1[..end]);
    format!("{}({}){}", stem, short, ext)
}

/// Lowercased `sha1` if it is a 40 digit hex digest.
pub(crate) fn validate_sha1(sha1: &str) -> BuildResult<String> {
    let normalized = sha1.to_ascii_lowercase();
    if normalized.len() == 40 && normalized.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(normalized)
    } else {
        Err(BuildError::Storage(format!("Invalid sha1 digest: {:?}", sha1)))
    }
}

// ============================================================================
// UPDATE CACHE
// ============================================================================

/// The only writer of the cache directory.
pub struct UpdateCache {
    dir: PathBuf,
}

impl std::fmt::Debug for UpdateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateCache").field("dir", &self.dir).finish()
    }
}

impl UpdateCache {
    /// Open (and create if needed) the cache at `dir`.
    pub fn new(dir: PathBuf) -> BuildResult<Self> {
        std::fs::create_dir_all(&dir).map_err(|e| {
            BuildError::Storage(format!(
                "Failed to create cache directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ========================================================================
    // LOOKUPS [immutable, &self]
    // ========================================================================

    /// Whether a verified payload for `sha1` is present. Friendly-name links
    /// are not consulted.
    pub fn is_cached(&self, sha1: &str) -> bool {
        self.cache_path(sha1).is_file()
    }

    /// Path of the verified payload.
    pub fn cache_path(&self, sha1: &str) -> PathBuf {
        self.dir.join(sha1.to_ascii_lowercase())
    }

    /// Path of the in-progress download.
    pub fn part_path(&self, sha1: &str) -> PathBuf {
        self.dir.join(format!("{}.part", sha1.to_ascii_lowercase()))
    }

    /// Path of the friendly-name link.
    pub fn link_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    // ========================================================================
    // MAINTENANCE [mutating]
    // ========================================================================

    /// Make the cache hold exactly the payloads in `expected` (sha1 → name).
    ///
    /// Removes every entry whose file name is neither an expected hash nor
    /// an expected friendly name, then points each friendly name at its hash
    /// when that payload is present. Stale links are replaced; links to
    /// payloads that are missing are removed. Individual removal failures are
    /// logged and skipped.
    pub fn prune_and_link(&self, expected: &HashMap<String, String>) -> BuildResult<()> {
        tracing::info!(dir = %self.dir.display(), "Pruning update cache");

        let expected: HashMap<String, String> = expected
            .iter()
            .filter_map(|(sha1, name)| match validate_sha1(sha1) {
                Ok(sha1) => Some((sha1, name.clone())),
                Err(e) => {
                    tracing::warn!("Not linking {}: {}", name, e);
                    None
                }
            })
            .collect();
        let keep: HashSet<&str> = expected
            .iter()
            .flat_map(|(sha1, name)| [sha1.as_str(), name.as_str()])
            .collect();

        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            BuildError::Storage(format!("Failed to list {}: {}", self.dir.display(), e))
        })?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if keep.contains(name.as_str()) {
                continue;
            }
            tracing::info!("Removing {}", name);
            if let Err(e) = std::fs::remove_file(entry.path()) {
                tracing::warn!("Cache pruning of {} failed: {}", name, e);
            }
        }

        for (sha1, name) in &expected {
            let link = self.link_path(name);
            let current = std::fs::read_link(&link).ok();
            let link_exists = current.is_some() || link.symlink_metadata().is_ok();

            if self.cache_path(sha1).exists() {
                if current.as_deref() == Some(Path::new(sha1)) {
                    tracing::debug!("Found {} -> {}", name, sha1);
                    continue;
                }
                if link_exists {
                    tracing::info!("Removing stale link {} -> {:?}", name, current);
                    if let Err(e) = std::fs::remove_file(&link) {
                        tracing::warn!("Cache pruning of {} failed: {}", name, e);
                        continue;
                    }
                }
                tracing::info!("Creating {} -> {}", name, sha1);
                std::os::unix::fs::symlink(sha1, &link).map_err(|e| {
                    BuildError::Storage(format!(
                        "Failed when creating link from {} to {}: {}",
                        sha1,
                        link.display(),
                        e
                    ))
                })?;
            } else if link_exists {
                tracing::info!("Removing stale link {} -> {:?}", name, current);
                if let Err(e) = std::fs::remove_file(&link) {
                    tracing::warn!("Cache pruning of {} failed: {}", name, e);
                }
            }
        }

        Ok(())
    }

    /// Start a download for `sha1` into `<sha1>.part`, truncating any
    /// leftover partial file.
    pub async fn stage(&self, sha1: &str, friendly_name: &str) -> BuildResult<StagedDownload> {
        let sha1 = validate_sha1(sha1)?;
        let staged_path = self.part_path(&sha1);

        let file = tokio::fs::File::create(&staged_path).await.map_err(|e| {
            BuildError::Storage(format!(
                "Couldn't create temporary file at {}: {}",
                staged_path.display(),
                e
            ))
        })?;

        Ok(StagedDownload {
            final_path: self.cache_path(&sha1),
            link_path: self.link_path(friendly_name),
            staged_path,
            expected_sha1: sha1,
            file: Some(file),
        })
    }
}

// ============================================================================
// STAGED DOWNLOAD
// ============================================================================

/// A payload being written to `<sha1>.part`.
///
/// Nothing becomes visible under the hash-named path until
/// [`commit`](Self::commit) has verified the content.
pub struct StagedDownload {
    staged_path: PathBuf,
    final_path: PathBuf,
    link_path: PathBuf,
    expected_sha1: String,
    file: Option<tokio::fs::File>,
}

impl StagedDownload {
    pub fn staged_path(&self) -> &Path {
        &self.staged_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Append a chunk.
    pub async fn write(&mut self, chunk: &[u8]) -> BuildResult<()> {
        let file = self.file.as_mut().ok_or_else(|| {
            BuildError::Internal(format!("{} already closed", self.staged_path.display()))
        })?;
        file.write_all(chunk).await.map_err(|e| {
            BuildError::Storage(format!(
                "Writing to {} failed: {}",
                self.staged_path.display(),
                e
            ))
        })
    }

    /// Hash the staged file, reporting `(bytes_hashed, total)` after every
    /// chunk, then publish it.
    ///
    /// On mismatch the staged file is deleted and
    /// [`BuildError::ChecksumMismatch`] is returned. On match the file is
    /// renamed to its hash name and the friendly-name link is (re)created.
    pub async fn commit<F>(mut self, mut on_progress: F) -> BuildResult<()>
    where
        F: FnMut(u64, u64),
    {
        if let Some(mut file) = self.file.take() {
            file.flush().await.map_err(|e| {
                BuildError::Storage(format!(
                    "Failed to flush {}: {}",
                    self.staged_path.display(),
                    e
                ))
            })?;
        }

        let actual = match self.hash_staged(&mut on_progress).await {
            Ok(actual) => actual,
            Err(e) => {
                let _ = tokio::fs::remove_file(&self.staged_path).await;
                return Err(e);
            }
        };

        if actual != self.expected_sha1 {
            tracing::error!(
                staged = %self.staged_path.display(),
                expected = %self.expected_sha1,
                actual = %actual,
                "Checksum mismatch"
            );
            let _ = tokio::fs::remove_file(&self.staged_path).await;
            return Err(BuildError::ChecksumMismatch {
                expected: self.expected_sha1,
                actual,
            });
        }

        tokio::fs::rename(&self.staged_path, &self.final_path)
            .await
            .map_err(|e| {
                BuildError::Storage(format!(
                    "Failed when moving download to {}: {}",
                    self.final_path.display(),
                    e
                ))
            })?;

        if self.link_path.symlink_metadata().is_ok() {
            let _ = tokio::fs::remove_file(&self.link_path).await;
        }
        tokio::fs::symlink(&self.expected_sha1, &self.link_path)
            .await
            .map_err(|e| {
                BuildError::Storage(format!(
                    "Failed when creating link from {} to {}: {}",
                    self.expected_sha1,
                    self.link_path.display(),
                    e
                ))
            })?;

        tracing::debug!(sha1 = %self.expected_sha1, "Committed download");
        Ok(())
    }

    async fn hash_staged<F>(&self, on_progress: &mut F) -> BuildResult<String>
    where
        F: FnMut(u64, u64),
    {
        let mut file = tokio::fs::File::open(&self.staged_path).await.map_err(|e| {
            BuildError::Storage(format!(
                "Failed to open {}: {}",
                self.staged_path.display(),
                e
            ))
        })?;
        let total = file
            .metadata()
            .await
            .map(|m| m.len())
            .map_err(|e| BuildError::Storage(format!("Failed to stat temp file: {}", e)))?;

        let mut hasher = Sha1::new();
        let mut buffer = vec![0u8; HASH_CHUNK];
        let mut hashed = 0u64;
        loop {
            let n = file
                .read(&mut buffer)
                .await
                .map_err(|e| BuildError::Storage(format!("Failed to read temp file: {}", e)))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            hashed += n as u64;
            on_progress(hashed, total);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    /// Discard the staged file. Used when the transfer fails.
    pub async fn abort(mut self) {
        self.file.take();
        let _ = tokio::fs::remove_file(&self.staged_path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha1_of(data: &[u8]) -> String {
        hex::encode(Sha1::digest(data))
    }

    #[test]
    fn friendly_name_keeps_extension() {
        let sha1 = "3f1c5a2b9d0e8f7a6b5c4d3e2f1a0b9c8d7e6f5a";
        assert_eq!(
            friendly_name("https://example.com/dl/SecUpd2016-001.pkg", sha1),
            "SecUpd2016-001(3f1c5a2).pkg"
        );
        assert_eq!(
            friendly_name("https://example.com/dl/Combo.dmg?token=1", sha1),
            "Combo(3f1c5a2).dmg"
        );
        assert_eq!(friendly_name("https://example.com/blob", sha1), "blob(3f1c5a2)");
    }

    #[test]
    fn friendly_name_tolerates_non_ascii_digest() {
        assert_eq!(
            friendly_name("https://example.com/a.pkg", "ééééé"),
            "a(ééééé).pkg"
        );
        assert_eq!(
            friendly_name("https://example.com/a.pkg", "ééééééééé"),
            "a(ééééééé).pkg"
        );
    }

    #[test]
    fn prune_ignores_malformed_digests() {
        let temp = tempfile::tempdir().unwrap();
        let cache = UpdateCache::new(temp.path().join("Updates")).unwrap();
        let outside = temp.path().join("x");
        std::fs::write(&outside, b"not cached").unwrap();

        let expected = HashMap::from([("../x".to_string(), "Escape.pkg".to_string())]);
        cache.prune_and_link(&expected).unwrap();

        assert!(outside.is_file());
        assert!(cache.link_path("Escape.pkg").symlink_metadata().is_err());
    }

    #[test]
    fn new_creates_directory() {
        let temp = tempfile::tempdir().unwrap();
        let cache = UpdateCache::new(temp.path().join("Updates")).unwrap();
        assert!(cache.dir().is_dir());
    }

    #[tokio::test]
    async fn verified_download_is_published_with_link() {
        let temp = tempfile::tempdir().unwrap();
        let cache = UpdateCache::new(temp.path().to_path_buf()).unwrap();
        let data = b"payload bytes";
        let sha1 = sha1_of(data);

        let mut staged = cache.stage(&sha1, "Update(abc).pkg").await.unwrap();
        staged.write(&data[..4]).await.unwrap();
        staged.write(&data[4..]).await.unwrap();

        let mut progress = Vec::new();
        staged.commit(|done, total| progress.push((done, total))).await.unwrap();

        assert!(cache.is_cached(&sha1));
        assert!(!cache.part_path(&sha1).exists());
        assert_eq!(
            std::fs::read_link(cache.link_path("Update(abc).pkg")).unwrap(),
            PathBuf::from(&sha1)
        );
        assert_eq!(progress.last(), Some(&(data.len() as u64, data.len() as u64)));
    }

    #[tokio::test]
    async fn mismatched_download_is_never_published() {
        let temp = tempfile::tempdir().unwrap();
        let cache = UpdateCache::new(temp.path().to_path_buf()).unwrap();
        let expected = sha1_of(b"the real thing");

        let mut staged = cache.stage(&expected, "Update.pkg").await.unwrap();
        staged.write(b"something else").await.unwrap();
        let err = staged.commit(|_, _| {}).await.unwrap_err();

        match err {
            BuildError::ChecksumMismatch { expected: e, actual } => {
                assert_eq!(e, expected);
                assert_eq!(actual, sha1_of(b"something else"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!cache.is_cached(&expected));
        assert!(!cache.part_path(&expected).exists());
        assert!(cache.link_path("Update.pkg").symlink_metadata().is_err());
    }

    #[tokio::test]
    async fn invalid_digest_is_rejected_before_touching_disk() {
        let temp = tempfile::tempdir().unwrap();
        let cache = UpdateCache::new(temp.path().to_path_buf()).unwrap();
        assert!(cache.stage("../../etc/passwd", "x").await.is_err());
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn abort_removes_partial_file() {
        let temp = tempfile::tempdir().unwrap();
        let cache = UpdateCache::new(temp.path().to_path_buf()).unwrap();
        let sha1 = sha1_of(b"x");
        let mut staged = cache.stage(&sha1, "x.pkg").await.unwrap();
        staged.write(b"x").await.unwrap();
        staged.abort().await;
        assert!(!cache.part_path(&sha1).exists());
    }

    #[test]
    fn part_file_is_not_cached() {
        let temp = tempfile::tempdir().unwrap();
        let cache = UpdateCache::new(temp.path().to_path_buf()).unwrap();
        let sha1 = sha1_of(b"x");
        std::fs::write(cache.part_path(&sha1), b"x").unwrap();
        assert!(!cache.is_cached(&sha1));
    }

    #[test]
    fn prune_keeps_exactly_the_expected_subset() {
        let temp = tempfile::tempdir().unwrap();
        let cache = UpdateCache::new(temp.path().to_path_buf()).unwrap();

        let mut all = HashMap::new();
        for i in 0..4 {
            let data = format!("update {}", i);
            let sha1 = sha1_of(data.as_bytes());
            std::fs::write(cache.cache_path(&sha1), data).unwrap();
            all.insert(sha1, format!("Update{}.pkg", i));
        }
        cache.prune_and_link(&all).unwrap();
        std::fs::write(temp.path().join("leftover.part"), b"junk").unwrap();
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 9);

        let subset: HashMap<String, String> = all
            .iter()
            .filter(|(_, name)| name.as_str() < "Update2")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        assert_eq!(subset.len(), 2);
        cache.prune_and_link(&subset).unwrap();

        let mut remaining: Vec<String> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        remaining.sort();
        let mut expected: Vec<String> = subset
            .iter()
            .flat_map(|(sha1, name)| [sha1.clone(), name.clone()])
            .collect();
        expected.sort();
        assert_eq!(remaining, expected);
        for (sha1, name) in &subset {
            assert_eq!(
                std::fs::read_link(cache.link_path(name)).unwrap(),
                PathBuf::from(sha1)
            );
        }
    }

    #[test]
    fn prune_replaces_stale_link_and_drops_dangling_one() {
        let temp = tempfile::tempdir().unwrap();
        let cache = UpdateCache::new(temp.path().to_path_buf()).unwrap();
        let present = sha1_of(b"present");
        let missing = sha1_of(b"missing");
        std::fs::write(cache.cache_path(&present), b"present").unwrap();
        std::os::unix::fs::symlink("0000000000000000000000000000000000000000", cache.link_path("A.pkg")).unwrap();
        std::os::unix::fs::symlink(&missing, cache.link_path("B.pkg")).unwrap();

        let expected = HashMap::from([
            (present.clone(), "A.pkg".to_string()),
            (missing.clone(), "B.pkg".to_string()),
        ]);
        cache.prune_and_link(&expected).unwrap();

        assert_eq!(
            std::fs::read_link(cache.link_path("A.pkg")).unwrap(),
            PathBuf::from(&present)
        );
        assert!(cache.link_path("B.pkg").symlink_metadata().is_err());
    }
}
