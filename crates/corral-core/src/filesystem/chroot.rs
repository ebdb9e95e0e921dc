//! Root filesystem switching via `chroot(2)`.
//!
//! The confined child changes its root to the prepared invocation root and
//! moves its working directory there, so relative paths cannot reach the
//! host tree.

use std::path::Path;

use corral_common::error::{CorralError, Result};

/// Changes the process root to `new_root` and the working directory to `/`.
///
/// # Errors
///
/// Returns `CorralError::NotFound` if `new_root` does not exist, and
/// `CorralError::PermissionDenied` if `chroot(2)` or `chdir(2)` fails.
#[cfg(target_os = "linux")]
pub fn enter_root(new_root: &Path) -> Result<()> {
    if !new_root.is_dir() {
        return Err(CorralError::NotFound {
            kind: "root directory",
            id: new_root.display().to_string(),
        });
    }
    nix::unistd::chroot(new_root).map_err(|e| CorralError::PermissionDenied {
        message: format!("chroot into {} failed: {e}", new_root.display()),
    })?;
    nix::unistd::chdir("/").map_err(|e| CorralError::PermissionDenied {
        message: format!("chdir to new root failed: {e}"),
    })?;
    tracing::info!(new_root = %new_root.display(), "entered chroot");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: confinement requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn enter_root(_new_root: &Path) -> Result<()> {
    Err(CorralError::Config {
        message: "Linux required for native container operations".into(),
    })
}
