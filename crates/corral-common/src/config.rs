//! Global configuration model for the Corral runtime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CorralError, Result};

/// Root configuration for the Corral runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorralConfig {
    /// Directory under which per-invocation roots are created.
    pub rootfs_dir: PathBuf,
    /// Directory holding per-invocation handoff pipes.
    pub runtime_dir: PathBuf,
    /// Mount point of the cgroup v2 hierarchy.
    pub cgroup_root: PathBuf,
    /// Limits applied to every invocation's cgroup.
    pub limits: crate::types::ResourceLimits,
    /// Hostname set inside the UTS namespace.
    pub hostname: String,
    /// Seconds to wait for the child to publish its cgroup.
    pub setup_timeout_secs: u64,
    /// Seconds the confined command may run before it is killed.
    pub run_timeout_secs: Option<u64>,
    /// Image registry endpoints.
    pub registry: RegistryConfig,
}

impl Default for CorralConfig {
    fn default() -> Self {
        Self {
            rootfs_dir: crate::constants::default_rootfs_dir(),
            runtime_dir: crate::constants::default_runtime_dir(),
            cgroup_root: PathBuf::from(crate::constants::CGROUP_V2_PATH),
            limits: crate::types::ResourceLimits::default(),
            hostname: crate::constants::DEFAULT_HOSTNAME.into(),
            setup_timeout_secs: crate::constants::DEFAULT_SETUP_TIMEOUT_SECS,
            run_timeout_secs: None,
            registry: RegistryConfig::default(),
        }
    }
}

impl CorralConfig {
    /// Loads a configuration from a JSON file.
    ///
    /// Fields missing from the file keep their default values.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CorralError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values the kernel or the launcher would reject later.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::Config` describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.limits.pids_max == 0 {
            return Err(CorralError::Config {
                message: "pids_max must be at least 1".into(),
            });
        }
        if self.hostname.is_empty() || self.hostname.len() > 64 {
            return Err(CorralError::Config {
                message: format!("hostname must be 1-64 bytes, got {:?}", self.hostname),
            });
        }
        if self.setup_timeout_secs == 0 {
            return Err(CorralError::Config {
                message: "setup_timeout_secs must be positive".into(),
            });
        }
        Ok(())
    }

    /// Returns the bound on the handoff wait.
    #[must_use]
    pub const fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }

    /// Returns the bound on the exit wait, if any.
    #[must_use]
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

/// Endpoints used by the registry image provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Token endpoint for anonymous bearer authentication.
    pub auth_url: String,
    /// Service name passed to the token endpoint.
    pub auth_service: String,
    /// Registry API base URL.
    pub registry_url: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            auth_url: crate::constants::DEFAULT_AUTH_URL.into(),
            auth_service: crate::constants::DEFAULT_AUTH_SERVICE.into(),
            registry_url: crate::constants::DEFAULT_REGISTRY_URL.into(),
        }
    }
}
