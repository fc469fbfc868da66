//! dmgsmith builds deployable disk images from OS installers.
//!
//! The [`BuildScheduler`] runs a build as a fixed list of weighted tasks. It
//! mounts sources through the [`DiskImageManager`], launches the privileged
//! `dmgsmith-helper` through a [`HelperLauncher`], and listens on a
//! [`ProgressChannel`] for what the helper reports. Updates come from the
//! content-addressed [`UpdateCache`].

pub mod cache;
pub mod channel;
pub mod constants;
pub mod disk;
pub mod executor;
pub mod layout;
pub mod options;
pub mod package;
pub mod profiles;
pub mod scheduler;
pub mod sizing;
pub mod source;
pub mod template;
pub mod util;
pub mod watcher;

pub use cache::{DownloadEvent, UpdateCache, download_all};
pub use channel::{ProgressChannel, ProgressSender};
pub use disk::{DetachPolicy, DiskImageManager, Hdiutil, ImageTool};
pub use executor::{Elevation, HelperLauncher, LaunchOutcome, PrivilegedExecutor};
pub use layout::FilesystemLayout;
pub use options::{BuildOptions, ElevationPolicy};
pub use package::Package;
pub use profiles::{Update, UpdateProfiles};
pub use scheduler::{
    BuildHandle, BuildObserver, BuildOutcome, BuildRequest, BuildScheduler, BuildServices,
};
pub use sizing::{PackageSizer, SizeEstimate, SizeEstimator, SizeStrategy};
pub use source::{SourceInfo, SourceInspector, SourceKind};
pub use template::{Template, TemplateError};

pub use dmgsmith_shared::{BuildError, BuildResult, ProgressMessage};
