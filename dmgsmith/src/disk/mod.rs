//! Disk image lifecycle.
//!
//! [`DiskImageManager`] owns the table of attached images. It mounts through
//! an [`ImageTool`] (normally [`Hdiutil`]), deduplicates attaches per path and
//! retries detaches, which fail transiently while a volume is busy.

mod manager;
mod output;
mod tool;

pub use manager::{DetachPolicy, DiskImageManager};
pub use tool::{Hdiutil, ImageTool};
