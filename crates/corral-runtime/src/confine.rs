//! Child side of an invocation.
//!
//! Runs in the re-executed child, which is already PID 1 in fresh PID,
//! mount, and UTS namespaces. It joins a new pid-limited cgroup, tells the
//! parent the cgroup's name, isolates hostname and filesystem, runs the
//! command, and reports how it ended over a second pipe.

use std::io::ErrorKind;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Command, ExitStatus};

use corral_common::constants::{CONFINE_FAILURE_EXIT_CODE, CONFINEMENT_ENV};
use corral_common::error::{CorralError, Result};
use corral_common::types::{ConfineStage, ExitOutcome};
use corral_core::cgroup::{CgroupManager, CgroupName};
use corral_core::filesystem::{chroot, mount};
use corral_core::handoff::{self, HandoffWriter};
use corral_core::namespace::uts;
use serde::{Deserialize, Serialize};

use crate::invocation::Confinement;

/// Mount point of `/proc` inside the new root.
const PROC_MOUNT: &str = "/proc";

/// What the child tells the parent once it is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ConfinedReport {
    /// The command ran; this is how it ended.
    Completed {
        /// Exit code or terminating signal.
        outcome: ExitOutcome,
    },
    /// Confinement failed before the command could run.
    Failed {
        /// Stage that failed.
        stage: ConfineStage,
        /// Description of the failure.
        message: String,
        /// Cgroup the child had joined, for the parent to remove.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cgroup: Option<String>,
    },
    /// The command does not exist inside the root.
    CommandNotFound {
        /// The command as given.
        command: String,
    },
}

impl ConfinedReport {
    /// Builds the report for a confinement error.
    #[must_use]
    pub fn from_error(error: &CorralError) -> Self {
        match error {
            CorralError::CommandNotFound { command } => Self::CommandNotFound {
                command: command.clone(),
            },
            CorralError::Setup { stage, message } | CorralError::Isolation { stage, message } => {
                Self::Failed {
                    stage: *stage,
                    message: message.clone(),
                    cgroup: None,
                }
            }
            other => Self::Failed {
                stage: ConfineStage::Exec,
                message: other.to_string(),
                cgroup: None,
            },
        }
    }

    /// Records the cgroup a failed child had joined.
    #[must_use]
    pub fn with_cgroup(self, joined: Option<&CgroupName>) -> Self {
        match self {
            Self::Failed { stage, message, .. } => Self::Failed {
                stage,
                message,
                cgroup: joined.map(|name| name.as_str().to_owned()),
            },
            other => other,
        }
    }

    /// Returns the cgroup name carried by a failure report.
    #[must_use]
    pub fn cgroup(&self) -> Option<&str> {
        match self {
            Self::Failed { cgroup, .. } => cgroup.as_deref(),
            _ => None,
        }
    }

    /// Turns the report back into the invocation's result.
    ///
    /// # Errors
    ///
    /// Returns the setup, isolation, or command-not-found error the child
    /// reported.
    pub fn into_result(self) -> Result<ExitOutcome> {
        match self {
            Self::Completed { outcome } => Ok(outcome),
            Self::Failed { stage, message, .. } => Err(CorralError::at_stage(stage, message)),
            Self::CommandNotFound { command } => Err(CorralError::CommandNotFound { command }),
        }
    }

    /// Exit code the child process itself ends with.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Completed { outcome } => outcome.shell_code(),
            Self::Failed { .. } | Self::CommandNotFound { .. } => CONFINE_FAILURE_EXIT_CODE,
        }
    }
}

/// A child that holds its confinement and an open report pipe.
///
/// Only obtainable through [`Confined::enter`], which requires the
/// [`Confinement`] the launcher put in the environment.
#[derive(Debug)]
pub struct Confined {
    confinement: Confinement,
    report: HandoffWriter,
    cgroup: Option<CgroupName>,
}

impl Confined {
    /// Opens the report pipe so every later failure can be reported.
    ///
    /// # Errors
    ///
    /// Returns an error if the report pipe cannot be opened; nothing can be
    /// reported to the parent in that case.
    pub fn enter(confinement: Confinement) -> Result<Self> {
        let report = HandoffWriter::open(&confinement.report_path)?;
        tracing::debug!(root = %confinement.root.display(), "confinement entered");
        Ok(Self {
            confinement,
            report,
            cgroup: None,
        })
    }

    /// Confines this process, runs the command, and reports the result.
    ///
    /// Returns the exit code this process should end with.
    pub fn run(mut self, command: &str, args: &[String]) -> i32 {
        let report = match self.confine_and_exec(command, args) {
            Ok(outcome) => ConfinedReport::Completed { outcome },
            Err(e) => {
                tracing::error!(error = %e, "confinement failed");
                ConfinedReport::from_error(&e).with_cgroup(self.cgroup.as_ref())
            }
        };
        let code = report.exit_code();
        match serde_json::to_string(&report) {
            Ok(encoded) => {
                if let Err(e) = self.report.send(&encoded) {
                    tracing::warn!(error = %e, "failed to send report");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode report"),
        }
        code
    }

    /// Joins a fresh cgroup, then publishes its name to the parent.
    ///
    /// The name is recorded before publishing, so a failed handoff can
    /// still be reported with it.
    fn join_and_publish(&mut self) -> Result<()> {
        let cgroup = at(ConfineStage::Cgroup, join_cgroup(&self.confinement))?;
        self.cgroup = Some(cgroup.name().clone());
        at(
            ConfineStage::Handoff,
            handoff::send(&self.confinement.handoff_path, cgroup.name().as_str()),
        )
    }

    fn confine_and_exec(&mut self, command: &str, args: &[String]) -> Result<ExitOutcome> {
        self.join_and_publish()?;
        let c = &self.confinement;

        at(ConfineStage::Hostname, uts::set_hostname(&c.hostname))?;
        at(ConfineStage::MountPrivate, mount::make_mounts_private())?;
        at(ConfineStage::Chroot, chroot::enter_root(&c.root))?;
        let proc_mount = Path::new(PROC_MOUNT);
        at(ConfineStage::MountProc, mount::mount_proc(proc_mount))?;

        let result = exec_command(command, args);

        if let Err(e) = mount::unmount_proc(proc_mount) {
            tracing::warn!(error = %e, "failed to unmount /proc");
        }
        result
    }
}

/// Entry point of the hidden `child` mode.
///
/// Returns the exit code for this process.
///
/// # Errors
///
/// Returns an error if the process was not started by the launcher or the
/// report pipe cannot be opened.
pub fn child_main(command: &str, args: &[String]) -> Result<i32> {
    let confinement = Confinement::from_env()?;
    Ok(Confined::enter(confinement)?.run(command, args))
}

/// Creates the cgroup, applies limits, and moves this process into it.
///
/// A cgroup that was created but could not be joined is removed again.
fn join_cgroup(c: &Confinement) -> Result<CgroupManager> {
    let cgroup = CgroupManager::create(&c.cgroup_root, CgroupName::generate())?;
    let joined = cgroup
        .apply_limits(&c.limits)
        .and_then(|()| cgroup.add_process(std::process::id()));
    if let Err(e) = joined {
        if let Err(cleanup) = cgroup.destroy() {
            tracing::warn!(error = %cleanup, "failed to remove unjoined cgroup");
        }
        return Err(e);
    }
    Ok(cgroup)
}

fn exec_command(command: &str, args: &[String]) -> Result<ExitOutcome> {
    tracing::info!(command, ?args, "executing command");
    let status = Command::new(command)
        .args(args)
        .env_remove(CONFINEMENT_ENV)
        .status()
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => CorralError::CommandNotFound {
                command: command.to_owned(),
            },
            _ => CorralError::at_stage(ConfineStage::Exec, format!("{command}: {e}")),
        })?;
    Ok(outcome_of(status))
}

fn outcome_of(status: ExitStatus) -> ExitOutcome {
    match (status.code(), status.signal()) {
        (Some(code), _) => ExitOutcome::Exited(code),
        (None, Some(signal)) => ExitOutcome::Signaled(signal),
        (None, None) => ExitOutcome::Exited(CONFINE_FAILURE_EXIT_CODE),
    }
}

/// Tags an error with the stage it happened in.
fn at<T>(stage: ConfineStage, result: Result<T>) -> Result<T> {
    result.map_err(|e| match e {
        CorralError::Setup { .. } | CorralError::Isolation { .. } => e,
        other => CorralError::at_stage(stage, other.to_string()),
    })
}
