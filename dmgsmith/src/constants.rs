//! Constants for the dmgsmith build pipeline.
//!
//! Fixed phase weights, sizing policy defaults and external tool locations.

pub use dmgsmith_shared::constants::{exit_status, helper_cli};

const MIB: u64 = 1024 * 1024;

/// Phase weights, in bytes. Only their ratios matter.
pub mod weights {
    use super::MIB;

    pub const PREPARE: u64 = 34 * MIB;
    pub const STARTING_INSTALL: u64 = 21 * MIB;
    pub const CREATING_IMAGE: u64 = 21 * MIB;
    pub const INSTALLING_OS: u64 = 4 * 1024 * MIB;
    /// Added to every package's on-disk size.
    pub const PACKAGE_OVERHEAD: u64 = 100 * MIB;
    pub const CONVERTING_IMAGE: u64 = 313 * MIB;
    /// The four asr imagescan passes. The last one does not always happen.
    pub const SCAN_PASSES: [u64; 4] = [2 * MIB, MIB, 150 * MIB, 17 * MIB];
    pub const FINISH: u64 = MIB;
}

/// Output image sizing defaults.
pub mod sizing {
    pub const SLACK_FACTOR: f64 = 1.1;
    pub const OVERHEAD_GB: u64 = 23;
    /// Multiplier applied to on-disk size when nothing better is known.
    pub const HEURISTIC_FACTOR: u64 = 2;
    pub const BYTES_PER_GB: f64 = 1_000_000_000.0;
}

/// Detach retry policy defaults.
pub mod detach {
    pub const ATTEMPTS: u32 = 5;
    /// First attempt that passes `-force`.
    pub const FORCE_FROM_ATTEMPT: u32 = 3;
    pub const RETRY_DELAY_MS: u64 = 1000;
}

/// External programs.
pub mod tools {
    pub const HDIUTIL: &str = "/usr/bin/hdiutil";
    pub const INSTALLER: &str = "/usr/sbin/installer";
    pub const XAR: &str = "/usr/bin/xar";
    pub const ASR: &str = "/usr/sbin/asr";
    pub const SUDO: &str = "/usr/bin/sudo";
    pub const OSASCRIPT: &str = "/usr/bin/osascript";
    pub const PKEXEC: &str = "/usr/bin/pkexec";
    pub const INSTALL_SCRIPT: &str = "./installesdtodmg.sh";
}

/// Well-known paths inside mounted installer media.
pub mod media {
    pub const INSTALL_ESD: &str = "Contents/SharedSupport/InstallESD.dmg";
    pub const OS_INSTALL_PKG: &str = "Packages/OSInstall.mpkg";
    pub const BASE_SYSTEM: &str = "BaseSystem.dmg";
    pub const SYSTEM_VERSION: &str = "System/Library/CoreServices/SystemVersion.plist";
    pub const DEFAULT_VOLUME_NAME: &str = "Macintosh HD";
}

pub mod envs {
    pub const DMGSMITH_HOME: &str = "DMGSMITH_HOME";
    pub const DMGSMITH_RUNTIME_DIR: &str = "DMGSMITH_RUNTIME_DIR";
}

/// Name of the progress-watching helper binary.
pub const HELPER_BINARY: &str = "dmgsmith-helper";
