//! Domain primitive types used across the Corral workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for one `run` invocation.
///
/// Names the invocation's root directory and handoff pipes so that two
/// invocations on the same host never share them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationId(String);

impl InvocationId {
    /// Creates an invocation ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random invocation ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SHA-256 hash digest used for content verification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sha256Hash(String);

impl Sha256Hash {
    /// Creates a hash from a hex-encoded string.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a valid 64-character hex string.
    pub fn from_hex(hex: impl Into<String>) -> crate::error::Result<Self> {
        let hex = hex.into();
        if hex.len() != crate::constants::SHA256_HEX_LENGTH
            || !hex.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(crate::error::CorralError::Config {
                message: format!("invalid SHA-256 hex string: {hex}"),
            });
        }
        Ok(Self(hex.to_ascii_lowercase()))
    }

    /// Parses an OCI digest of the form `sha256:<hex>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the algorithm is not `sha256` or the hex is invalid.
    pub fn from_digest(digest: &str) -> crate::error::Result<Self> {
        let hex = digest
            .strip_prefix("sha256:")
            .ok_or_else(|| crate::error::CorralError::Config {
                message: format!("unsupported digest algorithm: {digest}"),
            })?;
        Self::from_hex(hex)
    }

    /// Returns the hex-encoded hash string.
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.0)
    }
}

/// Resource limits applied to an invocation's cgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum number of processes (`pids.max`).
    pub pids_max: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            pids_max: crate::constants::DEFAULT_PIDS_MAX,
        }
    }
}

/// How a confined command ended.
///
/// This is the result of an invocation, never an error: a non-zero exit or
/// a fatal signal is the command's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitOutcome {
    /// The command exited with this code.
    Exited(i32),
    /// The command was terminated by this signal number.
    Signaled(i32),
}

impl ExitOutcome {
    /// Returns whether the command exited with code 0.
    #[must_use]
    pub const fn success(self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Returns the shell-style status: the exit code, or `128 + signal`.
    #[must_use]
    pub const fn shell_code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(signal) => 128 + signal,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(signal) => write!(f, "terminated by signal {signal}"),
        }
    }
}

/// Ordered steps the confined child performs before running the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfineStage {
    /// Creating, limiting, and joining the cgroup.
    Cgroup,
    /// Publishing the cgroup name to the parent.
    Handoff,
    /// Setting the UTS hostname.
    Hostname,
    /// Making the mount tree private.
    MountPrivate,
    /// Changing the filesystem root.
    Chroot,
    /// Mounting `/proc` inside the new root.
    MountProc,
    /// Spawning the target command.
    Exec,
}

impl ConfineStage {
    /// Returns whether a failure at this stage is a setup error.
    #[must_use]
    pub const fn is_setup(self) -> bool {
        matches!(self, Self::Cgroup | Self::Handoff)
    }
}

impl fmt::Display for ConfineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cgroup => "cgroup",
            Self::Handoff => "handoff",
            Self::Hostname => "hostname",
            Self::MountPrivate => "mount-private",
            Self::Chroot => "chroot",
            Self::MountProc => "mount-proc",
            Self::Exec => "exec",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_invocation_ids_differ() {
        assert_ne!(InvocationId::generate(), InvocationId::generate());
    }

    #[test]
    fn generated_invocation_id_is_path_safe() {
        let id = InvocationId::generate();
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn sha256_from_digest_strips_algorithm() {
        let hex = "a".repeat(64);
        let hash = Sha256Hash::from_digest(&format!("sha256:{hex}")).expect("valid digest");
        assert_eq!(hash.as_hex(), hex);
        assert_eq!(hash.to_string(), format!("sha256:{hex}"));
    }

    #[test]
    fn sha256_rejects_other_algorithms() {
        assert!(Sha256Hash::from_digest(&format!("sha512:{}", "a".repeat(64))).is_err());
        assert!(Sha256Hash::from_hex("xyz").is_err());
    }

    #[test]
    fn exit_outcome_shell_code() {
        assert_eq!(ExitOutcome::Exited(7).shell_code(), 7);
        assert_eq!(ExitOutcome::Signaled(9).shell_code(), 137);
        assert!(ExitOutcome::Exited(0).success());
        assert!(!ExitOutcome::Signaled(15).success());
    }

    #[test]
    fn only_cgroup_and_handoff_are_setup_stages() {
        assert!(ConfineStage::Cgroup.is_setup());
        assert!(ConfineStage::Handoff.is_setup());
        assert!(!ConfineStage::Chroot.is_setup());
        assert!(!ConfineStage::MountProc.is_setup());
    }

    #[test]
    fn default_limits_use_twenty_pids() {
        assert_eq!(ResourceLimits::default().pids_max, 20);
    }
}
