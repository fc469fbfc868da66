//! The platform disk-image tool, behind a trait so the manager can be driven
//! by a scripted stand-in.

use std::path::Path;

use async_trait::async_trait;
use dmgsmith_shared::errors::BuildResult;

use crate::constants::tools;
use crate::util::{ToolOutput, run_tool};

/// Attach/detach/query primitive operations.
///
/// Implementations return the raw tool result; interpreting exit codes and
/// plist output is the manager's job.
#[async_trait]
pub trait ImageTool: Send + Sync {
    /// Attach `image` and print a plist describing its system entities.
    async fn attach(&self, image: &Path) -> BuildResult<ToolOutput>;

    /// Unmount the volume at `mount_point`.
    async fn detach(&self, mount_point: &Path, force: bool) -> BuildResult<ToolOutput>;

    /// Print a plist describing every currently attached image.
    async fn info(&self) -> BuildResult<ToolOutput>;
}

/// `hdiutil`.
#[derive(Clone, Debug)]
pub struct Hdiutil {
    program: String,
}

impl Default for Hdiutil {
    fn default() -> Self {
        Self {
            program: tools::HDIUTIL.to_string(),
        }
    }
}

impl Hdiutil {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn attach_args(image: &Path) -> Vec<String> {
        vec![
            "attach".into(),
            image.display().to_string(),
            "-mountRandom".into(),
            "/tmp".into(),
            "-nobrowse".into(),
            "-noverify".into(),
            "-plist".into(),
        ]
    }

    fn detach_args(mount_point: &Path, force: bool) -> Vec<String> {
        let mut args = vec!["detach".into(), mount_point.display().to_string()];
        if force {
            args.push("-force".into());
        }
        args
    }
}

#[async_trait]
impl ImageTool for Hdiutil {
    async fn attach(&self, image: &Path) -> BuildResult<ToolOutput> {
        // Images with a license agreement wait for confirmation on stdin.
        run_tool(&self.program, &Self::attach_args(image), Some(b"Y\n")).await
    }

    async fn detach(&self, mount_point: &Path, force: bool) -> BuildResult<ToolOutput> {
        run_tool(&self.program, &Self::detach_args(mount_point, force), None).await
    }

    async fn info(&self) -> BuildResult<ToolOutput> {
        run_tool(&self.program, &["info".into(), "-plist".into()], None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_requests_plist_and_random_mount() {
        let args = Hdiutil::attach_args(Path::new("/x/Install.dmg"));
        assert_eq!(args[0], "attach");
        assert_eq!(args[1], "/x/Install.dmg");
        assert!(args.contains(&"-plist".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-mountRandom" && w[1] == "/tmp"));
    }

    #[test]
    fn force_is_appended_last() {
        let mp = Path::new("/tmp/dmg.abc");
        assert_eq!(Hdiutil::detach_args(mp, false), vec!["detach", "/tmp/dmg.abc"]);
        assert_eq!(
            Hdiutil::detach_args(mp, true),
            vec!["detach", "/tmp/dmg.abc", "-force"]
        );
    }
}
