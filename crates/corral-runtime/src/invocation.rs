//! What to run, and the confinement the parent hands to its child.

use std::path::PathBuf;

use corral_common::constants::CONFINEMENT_ENV;
use corral_common::error::{CorralError, Result};
use corral_common::types::ResourceLimits;
use serde::{Deserialize, Serialize};

/// A single request to run a command inside an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Image reference handed to the image provider.
    pub image: String,
    /// Command to execute inside the root.
    pub command: String,
    /// Arguments passed to the command.
    pub args: Vec<String>,
}

impl Invocation {
    /// Creates an invocation.
    pub fn new(
        image: impl Into<String>,
        command: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            image: image.into(),
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Everything the re-executed child needs to confine itself.
///
/// Only the launcher produces this value; the child refuses to run without
/// it. It travels in the `CORRAL_CONFINEMENT` environment variable as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confinement {
    /// Prepared and populated root directory.
    pub root: PathBuf,
    /// Pipe on which the child publishes its cgroup name.
    pub handoff_path: PathBuf,
    /// Pipe on which the child reports how the command ended.
    pub report_path: PathBuf,
    /// Mount point of the cgroup v2 hierarchy.
    pub cgroup_root: PathBuf,
    /// Limits written into the child's cgroup.
    pub limits: ResourceLimits,
    /// Hostname set in the child's UTS namespace.
    pub hostname: String,
}

impl Confinement {
    /// Encodes the confinement for the child's environment.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_env_value(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a confinement from its environment encoding.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::Config` if the value is not a valid encoding.
    pub fn from_env_value(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| CorralError::Config {
            message: format!("malformed {CONFINEMENT_ENV}: {e}"),
        })
    }

    /// Reads the confinement the launcher placed in this process's
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::Config` if the variable is missing or malformed,
    /// which means the process was not started by the launcher.
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(CONFINEMENT_ENV).map_err(|_| CorralError::Config {
            message: format!(
                "{CONFINEMENT_ENV} is not set; the child mode is only entered by `corral run`"
            ),
        })?;
        Self::from_env_value(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Confinement {
        Confinement {
            root: "/var/lib/corral/rootfs/abc".into(),
            handoff_path: "/var/lib/corral/run/abc.handoff".into(),
            report_path: "/var/lib/corral/run/abc.report".into(),
            cgroup_root: "/sys/fs/cgroup".into(),
            limits: ResourceLimits { pids_max: 20 },
            hostname: "container".into(),
        }
    }

    #[test]
    fn env_encoding_round_trips() {
        let confinement = sample();
        let raw = confinement.to_env_value().expect("encode");
        assert!(!raw.contains('\n'));
        assert_eq!(Confinement::from_env_value(&raw).expect("decode"), confinement);
    }

    #[test]
    fn garbage_is_a_config_error() {
        assert!(matches!(
            Confinement::from_env_value("{\"root\":1}"),
            Err(CorralError::Config { .. })
        ));
    }

    #[test]
    fn invocation_collects_args() {
        let inv = Invocation::new("busybox", "echo", ["hello", "world"]);
        assert_eq!(inv.command, "echo");
        assert_eq!(inv.args, vec!["hello".to_owned(), "world".to_owned()]);
    }
}
