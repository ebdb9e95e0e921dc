//! Ephemeral root directory for one invocation.
//!
//! [`RootDir`] owns the directory: it is created before the image is
//! populated and removed once the child has exited, whether through an
//! explicit [`RootDir::teardown`] or by being dropped on an error path.
//! Removal failures are logged and never escalate, since the invocation's
//! result is already known by then.

use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use corral_common::error::{CorralError, Result};
use corral_common::types::InvocationId;

/// Mode of a freshly prepared root.
const ROOT_MODE: u32 = 0o777;

/// Owning handle to an invocation's root directory.
#[derive(Debug)]
pub struct RootDir {
    path: PathBuf,
    removed: bool,
}

impl RootDir {
    /// Creates `<base>/<id>` with permissive mode.
    ///
    /// The base directory is created if needed. The invocation directory
    /// itself must not exist yet, so no two invocations share a root.
    ///
    /// # Errors
    ///
    /// Returns an error if either directory cannot be created or its mode
    /// cannot be set.
    pub fn prepare(base: &Path, id: &InvocationId) -> Result<Self> {
        std::fs::create_dir_all(base).map_err(|e| CorralError::Io {
            path: base.to_path_buf(),
            source: e,
        })?;
        Self::prepare_at(base.join(id.as_str()))
    }

    /// Creates the root at an exact path whose parent already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists or cannot be created.
    pub fn prepare_at(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        std::fs::DirBuilder::new()
            .mode(ROOT_MODE)
            .create(&path)
            .map_err(|e| CorralError::Io {
                path: path.clone(),
                source: e,
            })?;
        // The umask trims the mode given to mkdir(2).
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(ROOT_MODE)).map_err(
            |e| CorralError::Io {
                path: path.clone(),
                source: e,
            },
        )?;
        tracing::info!(path = %path.display(), "root directory prepared");
        Ok(Self {
            path,
            removed: false,
        })
    }

    /// Returns the root directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recursively removes the root directory.
    ///
    /// Best-effort: failures are logged, never returned.
    pub fn teardown(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => tracing::info!(path = %self.path.display(), "root directory removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "root directory already gone");
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove root directory");
            }
        }
    }
}

impl Drop for RootDir {
    fn drop(&mut self) {
        self.remove();
    }
}
