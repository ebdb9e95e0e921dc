//! Cgroups v2 resource management.
//!
//! Every invocation gets its own subgroup under
//! `<cgroup_root>/corral/<name>`, where `<name>` is a randomly generated
//! [`CgroupName`]. The confined child creates and joins the subgroup; the
//! parent learns the name over the handoff pipe and removes the subgroup
//! once the child has exited.

pub mod name;
pub mod pids;

use std::io::Write;
use std::path::{Path, PathBuf};

use corral_common::error::{CorralError, Result};
use corral_common::types::ResourceLimits;

pub use name::CgroupName;

/// Handle to the cgroup of one invocation.
#[derive(Debug)]
pub struct CgroupManager {
    name: CgroupName,
    /// Path to this invocation's cgroup directory.
    path: PathBuf,
}

impl CgroupManager {
    /// Creates a new cgroup with the given name.
    ///
    /// The `pids` controller is enabled in the root and in the `corral`
    /// parent on a best-effort basis; a kernel that already delegates it
    /// needs no change. The subgroup itself must not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent or the subgroup directory cannot be
    /// created.
    pub fn create(cgroup_root: &Path, name: CgroupName) -> Result<Self> {
        let parent = cgroup_root.join(corral_common::constants::CGROUP_PARENT);
        enable_controller(cgroup_root, "pids");
        std::fs::create_dir_all(&parent).map_err(|e| CorralError::Io {
            path: parent.clone(),
            source: e,
        })?;
        enable_controller(&parent, "pids");

        let path = parent.join(name.as_str());
        std::fs::create_dir(&path).map_err(|e| CorralError::Io {
            path: path.clone(),
            source: e,
        })?;
        tracing::info!(path = %path.display(), "cgroup created");
        Ok(Self { name, path })
    }

    /// Returns a handle to an existing cgroup, as named by the child.
    #[must_use]
    pub fn open(cgroup_root: &Path, name: CgroupName) -> Self {
        let path = cgroup_root
            .join(corral_common::constants::CGROUP_PARENT)
            .join(name.as_str());
        Self { name, path }
    }

    /// Applies resource limits to this cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to a cgroup control file fails.
    pub fn apply_limits(&self, limits: &ResourceLimits) -> Result<()> {
        pids::set_pids_max(&self.path, limits.pids_max)
    }

    /// Adds a process to this cgroup by writing its PID.
    ///
    /// The PID is interpreted in the writer's PID namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `cgroup.procs` fails.
    pub fn add_process(&self, pid: u32) -> Result<()> {
        let procs_path = self.path.join("cgroup.procs");
        std::fs::write(&procs_path, pid.to_string()).map_err(|e| CorralError::Io {
            path: procs_path,
            source: e,
        })?;
        tracing::debug!(pid, cgroup = %self.name, "added process to cgroup");
        Ok(())
    }

    /// Removes the cgroup.
    ///
    /// Cgroup directories are removed with `rmdir(2)`; the kernel refuses
    /// while processes remain inside. A cgroup that is already gone is not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup directory cannot be removed.
    pub fn destroy(&self) -> Result<()> {
        match std::fs::remove_dir(&self.path) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "cgroup destroyed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CorralError::Io {
                path: self.path.clone(),
                source: e,
            }),
        }
    }

    /// Returns the cgroup's generated name.
    #[must_use]
    pub const fn name(&self) -> &CgroupName {
        &self.name
    }

    /// Returns the cgroup directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Enables a controller for the children of `dir`.
///
/// Failure is only logged: the controller may already be enabled, or the
/// hierarchy may be delegated in a way that forbids the write.
fn enable_controller(dir: &Path, controller: &str) {
    let control = dir.join("cgroup.subtree_control");
    let result = std::fs::OpenOptions::new()
        .write(true)
        .open(&control)
        .and_then(|mut file| file.write_all(format!("+{controller}").as_bytes()));
    if let Err(e) = result {
        tracing::debug!(path = %control.display(), controller, error = %e, "controller not enabled");
    }
}
