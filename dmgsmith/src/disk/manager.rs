//! Tracked attach/detach of disk images.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dmgsmith_shared::errors::{BuildError, BuildResult};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use parking_lot::Mutex;

use super::output::{parse_attach, parse_info};
use super::tool::ImageTool;
use crate::options::BuildOptions;

type AttachFuture = Shared<BoxFuture<'static, Result<PathBuf, String>>>;

enum MountSlot {
    Mounted(PathBuf),
    /// An attach is in flight; later callers await the same future.
    Attaching(AttachFuture),
}

/// Retry policy for detach.
#[derive(Clone, Debug)]
pub struct DetachPolicy {
    pub attempts: u32,
    /// First attempt (1-based) that forces the unmount.
    pub force_from: u32,
    pub delay: Duration,
}

impl From<&BuildOptions> for DetachPolicy {
    fn from(options: &BuildOptions) -> Self {
        Self {
            attempts: options.detach_attempts.max(1),
            force_from: options.detach_force_after,
            delay: options.detach_retry_delay(),
        }
    }
}

/// Sole owner of the image path → mount point table.
///
/// Attaches of the same path are coalesced: while one is in flight every
/// other caller awaits it, and once it succeeds the cached mount point is
/// returned without touching the tool. No lock is held across an await.
pub struct DiskImageManager {
    tool: Arc<dyn ImageTool>,
    policy: DetachPolicy,
    mounts: Mutex<HashMap<PathBuf, MountSlot>>,
}

impl std::fmt::Debug for DiskImageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskImageManager")
            .field("policy", &self.policy)
            .field("tracked", &self.mounts.lock().len())
            .finish()
    }
}

impl DiskImageManager {
    pub fn new(tool: Arc<dyn ImageTool>, policy: DetachPolicy) -> Self {
        Self {
            tool,
            policy,
            mounts: Mutex::new(HashMap::new()),
        }
    }

    // ========================================================================
    // ATTACH
    // ========================================================================

    /// Attach `image` and return its mount point.
    ///
    /// Failures are surfaced as [`BuildError::Mount`] and never retried.
    pub async fn attach(&self, image: &Path) -> BuildResult<PathBuf> {
        let key = image.to_path_buf();

        let pending = {
            let mut mounts = self.mounts.lock();
            match mounts.get(&key) {
                Some(MountSlot::Mounted(mount_point)) => {
                    tracing::debug!(image = %image.display(), mount_point = %mount_point.display(), "Image already attached");
                    return Ok(mount_point.clone());
                }
                Some(MountSlot::Attaching(pending)) => {
                    tracing::debug!(image = %image.display(), "Joining in-flight attach");
                    pending.clone()
                }
                None => {
                    let pending = Self::spawn_attach(Arc::clone(&self.tool), key.clone());
                    mounts.insert(key.clone(), MountSlot::Attaching(pending.clone()));
                    pending
                }
            }
        };

        let result = pending.clone().await;

        {
            let mut mounts = self.mounts.lock();
            let still_ours = matches!(
                mounts.get(&key),
                Some(MountSlot::Attaching(current)) if current.ptr_eq(&pending)
            );
            if still_ours {
                match &result {
                    Ok(mount_point) => {
                        mounts.insert(key, MountSlot::Mounted(mount_point.clone()));
                    }
                    Err(_) => {
                        mounts.remove(&key);
                    }
                }
            }
        }

        result.map_err(BuildError::Mount)
    }

    /// Run the attach on its own task so it completes even if every caller
    /// goes away.
    fn spawn_attach(tool: Arc<dyn ImageTool>, image: PathBuf) -> AttachFuture {
        let handle = tokio::spawn(async move {
            Self::attach_with_tool(tool.as_ref(), &image)
                .await
                .map_err(|e| e.to_string())
        });
        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(format!("attach task failed: {}", e)))
        }
        .boxed()
        .shared()
    }

    async fn attach_with_tool(tool: &dyn ImageTool, image: &Path) -> BuildResult<PathBuf> {
        if let Some(mount_point) = Self::find_existing_mount(tool, image).await {
            tracing::info!(image = %image.display(), mount_point = %mount_point.display(), "Reusing existing mount");
            return Ok(mount_point);
        }

        tracing::info!(image = %image.display(), "Attaching disk image");
        let output = tool.attach(image).await?;
        if !output.success() {
            return Err(BuildError::Mount(format!(
                "hdiutil attach failed with return code {}: {}",
                output.status, output.stderr
            )));
        }

        let mount_point = parse_attach(&output.stdout, image)?;
        tracing::info!(image = %image.display(), mount_point = %mount_point.display(), "Attached disk image");
        Ok(mount_point)
    }

    /// Ask the OS whether `image` is already attached, by path or by the
    /// path it resolves to.
    async fn find_existing_mount(tool: &dyn ImageTool, image: &Path) -> Option<PathBuf> {
        let output = match tool.info().await {
            Ok(output) if output.success() => output,
            Ok(output) => {
                tracing::debug!(status = output.status, "hdiutil info failed, skipping mount lookup");
                return None;
            }
            Err(e) => {
                tracing::debug!(error = %e, "hdiutil info unavailable, skipping mount lookup");
                return None;
            }
        };

        let attached = match parse_info(&output.stdout) {
            Ok(attached) => attached,
            Err(e) => {
                tracing::debug!(error = %e, "Unreadable hdiutil info output");
                return None;
            }
        };

        let resolved = image.canonicalize().ok();
        attached.into_iter().find_map(|(path, mount_point)| {
            let same = path == image
                || (resolved.is_some() && path.canonicalize().ok() == resolved);
            same.then_some(mount_point)
        })
    }

    // ========================================================================
    // DETACH
    // ========================================================================

    /// Stop tracking `image` and unmount it, retrying with escalating force.
    ///
    /// Returns on the first successful attempt; otherwise the error of the
    /// final attempt.
    pub async fn detach(&self, image: &Path) -> BuildResult<()> {
        let slot = self.mounts.lock().remove(image);
        let mount_point = match slot {
            Some(MountSlot::Mounted(mount_point)) => mount_point,
            Some(MountSlot::Attaching(pending)) => pending.await.map_err(BuildError::Unmount)?,
            None => {
                return Err(BuildError::Unmount(format!(
                    "{} isn't mounted",
                    image.display()
                )));
            }
        };

        let mut last_error = String::new();
        for attempt in 1..=self.policy.attempts {
            let force = attempt >= self.policy.force_from;
            match self.tool.detach(&mount_point, force).await {
                Ok(output) if output.success() => {
                    tracing::info!(image = %image.display(), attempt, "Detached disk image");
                    return Ok(());
                }
                Ok(output) => {
                    last_error = format!(
                        "hdiutil detach failed with return code {}: {}",
                        output.status, output.stderr
                    );
                }
                Err(e) => last_error = e.to_string(),
            }

            tracing::warn!(
                image = %image.display(),
                attempt,
                force,
                error = %last_error,
                "Detach attempt failed"
            );
            if attempt < self.policy.attempts && !self.policy.delay.is_zero() {
                tokio::time::sleep(self.policy.delay).await;
            }
        }

        Err(BuildError::Unmount(last_error))
    }

    /// Detach every tracked image concurrently and return the failures once
    /// all of them have finished.
    pub async fn detach_all(&self) -> HashMap<PathBuf, BuildError> {
        let images = self.tracked();
        if images.is_empty() {
            return HashMap::new();
        }
        tracing::debug!(count = images.len(), "Detaching all images");

        let results = join_all(images.into_iter().map(|image| async move {
            let result = self.detach(&image).await;
            (image, result)
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(image, result)| result.err().map(|e| (image, e)))
            .collect()
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// Mount point of a completed attach.
    pub fn mount_point(&self, image: &Path) -> Option<PathBuf> {
        match self.mounts.lock().get(image) {
            Some(MountSlot::Mounted(mount_point)) => Some(mount_point.clone()),
            _ => None,
        }
    }

    /// Images that are attached or attaching.
    pub fn tracked(&self) -> Vec<PathBuf> {
        self.mounts.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ToolOutput;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn attach_plist(mount_point: &str) -> Vec<u8> {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict><key>system-entities</key><array>
<dict><key>mount-point</key><string>{}</string><key>potentially-mountable</key><true/></dict>
</array></dict></plist>"#,
            mount_point
        )
        .into_bytes()
    }

    #[derive(Default)]
    struct FakeTool {
        attaches: AtomicUsize,
        detach_calls: Mutex<Vec<bool>>,
        detach_fails: bool,
        info_output: Option<Vec<u8>>,
    }

    #[async_trait]
    impl ImageTool for FakeTool {
        async fn attach(&self, _image: &Path) -> BuildResult<ToolOutput> {
            let n = self.attaches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(ToolOutput {
                status: 0,
                stdout: attach_plist(&format!("/tmp/dmg.{}", n)),
                stderr: String::new(),
            })
        }

        async fn detach(&self, _mount_point: &Path, force: bool) -> BuildResult<ToolOutput> {
            let mut calls = self.detach_calls.lock();
            calls.push(force);
            Ok(ToolOutput {
                status: if self.detach_fails { 16 } else { 0 },
                stdout: Vec::new(),
                stderr: format!("resource busy (attempt {})", calls.len()),
            })
        }

        async fn info(&self) -> BuildResult<ToolOutput> {
            Ok(ToolOutput {
                status: 0,
                stdout: self.info_output.clone().unwrap_or_else(|| {
                    br#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict><key>images</key><array/></dict></plist>"#
                        .to_vec()
                }),
                stderr: String::new(),
            })
        }
    }

    fn manager(tool: Arc<FakeTool>) -> DiskImageManager {
        DiskImageManager::new(tool, DetachPolicy::from(&BuildOptions::for_tests()))
    }

    #[tokio::test]
    async fn concurrent_attaches_share_one_mount() {
        let tool = Arc::new(FakeTool::default());
        let manager = manager(Arc::clone(&tool));
        let image = Path::new("/images/Install.dmg");

        let (a, b) = tokio::join!(manager.attach(image), manager.attach(image));

        assert_eq!(tool.attaches.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(
            manager.mount_point(image),
            Some(PathBuf::from("/tmp/dmg.0"))
        );
    }

    #[tokio::test]
    async fn cached_attach_does_not_call_tool() {
        let tool = Arc::new(FakeTool::default());
        let manager = manager(Arc::clone(&tool));
        let image = Path::new("/images/Install.dmg");

        manager.attach(image).await.unwrap();
        manager.attach(image).await.unwrap();
        assert_eq!(tool.attaches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn existing_os_mount_is_reused() {
        let info = br#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict><key>images</key><array><dict>
<key>image-path</key><string>/images/Install.dmg</string>
<key>system-entities</key><array><dict><key>mount-point</key><string>/Volumes/Install</string></dict></array>
</dict></array></dict></plist>"#;
        let tool = Arc::new(FakeTool {
            info_output: Some(info.to_vec()),
            ..Default::default()
        });
        let manager = manager(Arc::clone(&tool));

        let mp = manager.attach(Path::new("/images/Install.dmg")).await.unwrap();
        assert_eq!(mp, PathBuf::from("/Volumes/Install"));
        assert_eq!(tool.attaches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_detach_is_attempted_five_times_with_late_force() {
        let tool = Arc::new(FakeTool {
            detach_fails: true,
            ..Default::default()
        });
        let manager = manager(Arc::clone(&tool));
        let image = Path::new("/images/Busy.dmg");
        manager.attach(image).await.unwrap();

        let err = manager.detach(image).await.unwrap_err();

        assert_eq!(*tool.detach_calls.lock(), vec![false, false, true, true, true]);
        assert_eq!(
            err.to_string(),
            "hdiutil detach failed with return code 16: resource busy (attempt 5)"
        );
        assert!(manager.tracked().is_empty());
    }

    #[tokio::test]
    async fn detach_of_untracked_image_fails() {
        let manager = manager(Arc::new(FakeTool::default()));
        let err = manager.detach(Path::new("/images/Nope.dmg")).await.unwrap_err();
        assert_eq!(err.to_string(), "/images/Nope.dmg isn't mounted");
    }

    #[tokio::test]
    async fn detach_all_joins_once_and_reports_failures() {
        let tool = Arc::new(FakeTool {
            detach_fails: true,
            ..Default::default()
        });
        let manager = manager(Arc::clone(&tool));
        manager.attach(Path::new("/a.dmg")).await.unwrap();
        manager.attach(Path::new("/b.dmg")).await.unwrap();

        let failures = manager.detach_all().await;

        assert_eq!(failures.len(), 2);
        assert!(failures.contains_key(Path::new("/a.dmg")));
        assert!(failures.contains_key(Path::new("/b.dmg")));
        assert_eq!(tool.detach_calls.lock().len(), 10);
        assert!(manager.tracked().is_empty());
    }

    #[tokio::test]
    async fn detach_all_success_is_empty() {
        let manager = manager(Arc::new(FakeTool::default()));
        manager.attach(Path::new("/a.dmg")).await.unwrap();
        assert!(manager.detach_all().await.is_empty());
        assert!(manager.detach_all().await.is_empty());
    }
}
