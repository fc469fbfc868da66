mod process;

pub use process::{ToolOutput, run_tool};

use std::path::{Path, PathBuf};

use crate::constants::envs;
use dmgsmith_shared::errors::{BuildError, BuildResult};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Find a companion binary (e.g. "dmgsmith-helper").
///
/// Looks next to the running executable first, then in
/// `$DMGSMITH_RUNTIME_DIR`.
pub fn find_binary(binary_name: &str) -> BuildResult<PathBuf> {
    let mut candidates = Vec::new();

    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        candidates.push(dir.join(binary_name));
    }

    if let Ok(runtime_dir) = std::env::var(envs::DMGSMITH_RUNTIME_DIR) {
        candidates.push(PathBuf::from(runtime_dir).join(binary_name));
    }

    for candidate in &candidates {
        tracing::debug!("Finding binary {:?} in path: {:?}", binary_name, candidate);
        if candidate.exists() {
            tracing::debug!(binary = %candidate.display(), "Found binary");
            return Ok(candidate.clone());
        }
    }

    let locations = candidates
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(BuildError::Config(format!(
        "Binary '{}' not found.\nSearched locations:\n{}",
        binary_name, locations
    )))
}

/// Install the global subscriber writing to `writer`.
///
/// Ignores a subscriber that is already installed so tests can call it freely.
pub fn register_to_tracing<W>(writer: W, env_filter: EnvFilter, ansi: bool)
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(ansi),
        )
        .try_init();
}

/// Human readable size in powers of 1000, e.g. "4.3 GB".
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["bytes", "kB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Apparent size of a file or of everything below a directory.
pub fn on_disk_size(path: &Path) -> BuildResult<u64> {
    let mut total = 0u64;
    for entry in walkdir::WalkDir::new(path) {
        let entry = entry.map_err(|e| {
            BuildError::Storage(format!("Failed to walk {}: {}", path.display(), e))
        })?;
        if entry.file_type().is_file() {
            let metadata = entry.metadata().map_err(|e| {
                BuildError::Storage(format!(
                    "Failed to stat {}: {}",
                    entry.path().display(),
                    e
                ))
            })?;
            total += metadata.len();
        }
    }
    Ok(total)
}
