//! UTS namespace isolation.
//!
//! Gives the container its own hostname.

use corral_common::error::{CorralError, Result};

/// Sets the hostname inside the UTS namespace.
///
/// Must only be called after the process has entered a new UTS namespace,
/// otherwise the host's hostname changes.
///
/// # Errors
///
/// Returns an error if `sethostname(2)` fails.
#[cfg(target_os = "linux")]
pub fn set_hostname(hostname: &str) -> Result<()> {
    nix::unistd::sethostname(hostname).map_err(|e| CorralError::PermissionDenied {
        message: format!("sethostname({hostname}) failed: {e}"),
    })?;
    tracing::debug!(hostname, "container hostname set");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: UTS namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn set_hostname(_hostname: &str) -> Result<()> {
    Err(CorralError::Config {
        message: "Linux required for native container operations".into(),
    })
}
