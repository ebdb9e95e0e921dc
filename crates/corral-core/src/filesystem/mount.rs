//! Mount utilities for the confined child.
//!
//! Everything here runs inside the child's own mount namespace. The tree is
//! made private first so that mounts made by the child never propagate
//! back to the host.

use std::path::Path;

use corral_common::error::{CorralError, Result};

/// Marks every mount in the current namespace as private, recursively.
///
/// # Errors
///
/// Returns an error if the `mount(2)` syscall fails.
#[cfg(target_os = "linux")]
pub fn make_mounts_private() -> Result<()> {
    use nix::mount::{MsFlags, mount};

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| CorralError::PermissionDenied {
        message: format!("making mounts private failed: {e}"),
    })?;
    tracing::debug!("mount tree made private");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: mount namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn make_mounts_private() -> Result<()> {
    Err(CorralError::Config {
        message: "Linux required for native container operations".into(),
    })
}

/// Mounts a fresh `proc` filesystem at `target`, creating the directory.
///
/// Inside a new PID namespace the mount shows only that namespace's
/// processes.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the mount fails.
#[cfg(target_os = "linux")]
pub fn mount_proc(target: &Path) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    std::fs::create_dir_all(target).map_err(|e| CorralError::Io {
        path: target.to_path_buf(),
        source: e,
    })?;
    mount(
        Some("proc"),
        target,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| CorralError::PermissionDenied {
        message: format!("mounting proc at {} failed: {e}", target.display()),
    })?;
    tracing::debug!(target = %target.display(), "proc mounted");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: procfs mounts require Linux.
#[cfg(not(target_os = "linux"))]
pub fn mount_proc(_target: &Path) -> Result<()> {
    Err(CorralError::Config {
        message: "Linux required for native container operations".into(),
    })
}

/// Detaches the `proc` mount at `target`.
///
/// # Errors
///
/// Returns an error if the `umount2(2)` syscall fails.
#[cfg(target_os = "linux")]
pub fn unmount_proc(target: &Path) -> Result<()> {
    nix::mount::umount2(target, nix::mount::MntFlags::MNT_DETACH).map_err(|e| {
        CorralError::PermissionDenied {
            message: format!("unmounting {} failed: {e}", target.display()),
        }
    })?;
    tracing::debug!(target = %target.display(), "proc unmounted");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: procfs mounts require Linux.
#[cfg(not(target_os = "linux"))]
pub fn unmount_proc(_target: &Path) -> Result<()> {
    Err(CorralError::Config {
        message: "Linux required for native container operations".into(),
    })
}
