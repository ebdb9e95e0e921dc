//! Process-count control via cgroups v2.
//!
//! Manages `pids.max` and reads `pids.current`.

use std::path::Path;

use corral_common::error::{CorralError, Result};

/// Sets the maximum number of processes allowed in a cgroup.
///
/// Once the limit is reached, `fork(2)` and `clone(2)` inside the cgroup
/// fail with `EAGAIN`.
///
/// # Errors
///
/// Returns an error if writing to `pids.max` fails.
pub fn set_pids_max(cgroup_path: &Path, max: u64) -> Result<()> {
    let file = cgroup_path.join("pids.max");
    std::fs::write(&file, max.to_string()).map_err(|e| CorralError::Io {
        path: file,
        source: e,
    })?;
    tracing::debug!(max, "pids max set");
    Ok(())
}

/// Reads the number of processes currently in a cgroup.
///
/// # Errors
///
/// Returns an error if `pids.current` cannot be read or parsed.
pub fn pids_current(cgroup_path: &Path) -> Result<u64> {
    let file = cgroup_path.join("pids.current");
    let raw = std::fs::read_to_string(&file).map_err(|e| CorralError::Io {
        path: file.clone(),
        source: e,
    })?;
    raw.trim().parse().map_err(|_| CorralError::Config {
        message: format!("unexpected content in {}: {raw:?}", file.display()),
    })
}
