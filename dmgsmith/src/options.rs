//! Build policy.
//!
//! Everything the pipeline would otherwise read from global preferences is
//! carried here and handed to the components at construction.

use crate::constants::{detach, sizing};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Elevation Policy
// ============================================================================

/// How the install helper gains root.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElevationPolicy {
    /// Run directly when already root, sudo when a password was supplied,
    /// otherwise prompt.
    #[default]
    Auto,
    /// Never elevate.
    None,
    /// Pipe the supplied password to sudo.
    Sudo,
    /// Ask through an interactive authorization prompt.
    Prompt,
}

// ============================================================================
// Build Options
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Total detach attempts before giving up.
    ///
    /// Default: 5
    #[serde(default = "default_detach_attempts")]
    pub detach_attempts: u32,

    /// First attempt (1-based) that passes `-force` to the detach command.
    ///
    /// Default: 3
    #[serde(default = "default_detach_force_after")]
    pub detach_force_after: u32,

    /// Pause between detach attempts, in milliseconds.
    ///
    /// Default: 1000
    #[serde(default = "default_detach_retry_delay_ms")]
    pub detach_retry_delay_ms: u64,

    /// Multiplier applied to the measured install size.
    ///
    /// Default: 1.1
    #[serde(default = "default_size_slack_factor")]
    pub size_slack_factor: f64,

    /// Fixed margin added to the output image size, in GB.
    ///
    /// Default: 23
    #[serde(default = "default_size_overhead_gb")]
    pub size_overhead_gb: u64,

    /// Multiplier for the last-resort install size estimate.
    ///
    /// Default: 2
    #[serde(default = "default_heuristic_size_factor")]
    pub heuristic_size_factor: u64,

    #[serde(default)]
    pub elevation: ElevationPolicy,

    /// Run `asr imagescan` on the finished image.
    ///
    /// Default: true
    #[serde(default = "default_finalize_scan")]
    pub finalize_scan: bool,

    /// Helper binary. Located next to the running executable when unset.
    #[serde(default)]
    pub helper_path: Option<PathBuf>,

    /// Directory holding `installesdtodmg.sh`, passed to the helper as `--cd`.
    #[serde(default)]
    pub resources_dir: Option<PathBuf>,
}

fn default_detach_attempts() -> u32 {
    detach::ATTEMPTS
}

fn default_detach_force_after() -> u32 {
    detach::FORCE_FROM_ATTEMPT
}

fn default_detach_retry_delay_ms() -> u64 {
    detach::RETRY_DELAY_MS
}

fn default_size_slack_factor() -> f64 {
    sizing::SLACK_FACTOR
}

fn default_size_overhead_gb() -> u64 {
    sizing::OVERHEAD_GB
}

fn default_heuristic_size_factor() -> u64 {
    sizing::HEURISTIC_FACTOR
}

fn default_finalize_scan() -> bool {
    true
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self::standard()
    }
}

impl BuildOptions {
    /// Production defaults.
    pub fn standard() -> Self {
        Self {
            detach_attempts: default_detach_attempts(),
            detach_force_after: default_detach_force_after(),
            detach_retry_delay_ms: default_detach_retry_delay_ms(),
            size_slack_factor: default_size_slack_factor(),
            size_overhead_gb: default_size_overhead_gb(),
            heuristic_size_factor: default_heuristic_size_factor(),
            elevation: ElevationPolicy::Auto,
            finalize_scan: default_finalize_scan(),
            helper_path: None,
            resources_dir: None,
        }
    }

    /// Same policy without the pauses between detach attempts.
    pub fn for_tests() -> Self {
        Self {
            detach_retry_delay_ms: 0,
            ..Self::standard()
        }
    }

    pub fn detach_retry_delay(&self) -> Duration {
        Duration::from_millis(self.detach_retry_delay_ms)
    }

    pub fn with_elevation(&mut self, elevation: ElevationPolicy) -> &mut Self {
        self.elevation = elevation;
        self
    }

    pub fn with_finalize_scan(&mut self, enabled: bool) -> &mut Self {
        self.finalize_scan = enabled;
        self
    }

    pub fn with_helper_path(&mut self, path: PathBuf) -> &mut Self {
        self.helper_path = Some(path);
        self
    }

    pub fn with_resources_dir(&mut self, path: PathBuf) -> &mut Self {
        self.resources_dir = Some(path);
        self
    }

    pub fn with_detach_retry_delay_ms(&mut self, ms: u64) -> &mut Self {
        self.detach_retry_delay_ms = ms;
        self
    }

    /// Output image size in GB for a measured install size:
    /// `ceil(required * slack / 1e9) + overhead`.
    pub fn default_volume_size_gb(&self, required_bytes: u64) -> u64 {
        let scaled = required_bytes as f64 * self.size_slack_factor / sizing::BYTES_PER_GB;
        scaled.ceil() as u64 + self.size_overhead_gb
    }
}
