//! Unified error types for the Corral workspace.
//!
//! The taxonomy follows the launch pipeline: setup and isolation failures
//! abort before user code runs, the command's own exit status is never an
//! error, and cleanup failures are logged by their callers rather than
//! surfaced through this type.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::ConfineStage;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum CorralError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A hash validation failed.
    #[error("hash mismatch for {resource}: expected {expected}, got {actual}")]
    HashMismatch {
        /// Resource that failed validation.
        resource: String,
        /// Expected hash value.
        expected: String,
        /// Actual computed hash value.
        actual: String,
    },

    /// A permission or capability error.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// The image registry rejected a request or returned unusable data.
    #[error("registry error: {message}")]
    Registry {
        /// Description of the registry failure.
        message: String,
    },

    /// Confinement setup failed before the command could run.
    #[error("setup failed during {stage}: {message}")]
    Setup {
        /// Stage that failed.
        stage: ConfineStage,
        /// Description of the failure.
        message: String,
    },

    /// Isolating the child (hostname, chroot, `/proc`) failed.
    #[error("isolation failed during {stage}: {message}")]
    Isolation {
        /// Stage that failed.
        stage: ConfineStage,
        /// Description of the failure.
        message: String,
    },

    /// The target command does not exist inside the confined root.
    #[error("command not found in container root: {command}")]
    CommandNotFound {
        /// Command that could not be resolved.
        command: String,
    },

    /// The child did not publish its cgroup within the setup deadline.
    #[error("confinement setup timed out after {}s", waited.as_secs_f64())]
    SetupTimedOut {
        /// How long the parent waited.
        waited: Duration,
    },

    /// The confined command exceeded its run deadline and was killed.
    #[error("confined command timed out after {}s", waited.as_secs_f64())]
    TimedOut {
        /// How long the parent waited.
        waited: Duration,
    },

    /// The child ended abnormally without reporting a result.
    #[error("confined child terminated abnormally: {message}")]
    ChildTerminated {
        /// Description of the termination.
        message: String,
    },

    /// The invocation was interrupted and its child killed.
    #[error("invocation interrupted")]
    Interrupted,
}

impl CorralError {
    /// Builds the error matching a failed confinement stage.
    ///
    /// Cgroup and handoff stages are setup errors, the rest isolation errors.
    #[must_use]
    pub fn at_stage(stage: ConfineStage, message: impl Into<String>) -> Self {
        let message = message.into();
        if stage.is_setup() {
            Self::Setup { stage, message }
        } else {
            Self::Isolation { stage, message }
        }
    }

    /// Returns the confinement stage this error belongs to, if any.
    #[must_use]
    pub const fn stage(&self) -> Option<ConfineStage> {
        match self {
            Self::Setup { stage, .. } | Self::Isolation { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CorralError>;
