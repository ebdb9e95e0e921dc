//! Parent side of an invocation.
//!
//! The launcher re-executes the running binary in `child` mode inside fresh
//! namespaces, waits for the child to publish its cgroup name, waits for it
//! to exit, then cleans up the cgroup and the root directory. Both waits
//! are bounded and interruptible, and teardown happens on every path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use corral_common::config::CorralConfig;
use corral_common::constants::{CHILD_SUBCOMMAND, CONFINEMENT_ENV, SELF_EXE};
use corral_common::error::{CorralError, Result};
use corral_common::types::{ConfineStage, ExitOutcome, InvocationId, ResourceLimits};
use corral_core::cgroup::{CgroupManager, CgroupName, pids};
use corral_core::filesystem::rootfs::RootDir;
use corral_core::handoff::{HandoffChannel, HandoffReader, POLL_INTERVAL};
use corral_core::namespace::NamespaceConfig;

use crate::confine::ConfinedReport;
use crate::invocation::{Confinement, Invocation};
use crate::process::{self, ChildProcess};

/// Attempts at removing a cgroup whose processes are still exiting.
const CGROUP_REMOVE_ATTEMPTS: u32 = 50;

/// How the handoff wait ended.
#[derive(Debug)]
enum Handoff {
    Received(CgroupName),
    ChildExited(ExitOutcome),
}

/// How the run wait ended.
#[derive(Debug)]
enum Exit {
    Exited(ExitOutcome),
    TimedOut,
    Interrupted,
}

/// Starts confined children and supervises them to completion.
#[derive(Debug, Clone)]
pub struct Launcher {
    executable: PathBuf,
    runtime_dir: PathBuf,
    cgroup_root: PathBuf,
    limits: ResourceLimits,
    hostname: String,
    namespaces: NamespaceConfig,
    setup_timeout: Duration,
    run_timeout: Option<Duration>,
    interrupt: Arc<AtomicBool>,
}

impl Launcher {
    /// Creates a launcher from the runtime configuration.
    #[must_use]
    pub fn new(config: &CorralConfig) -> Self {
        Self {
            executable: PathBuf::from(SELF_EXE),
            runtime_dir: config.runtime_dir.clone(),
            cgroup_root: config.cgroup_root.clone(),
            limits: config.limits,
            hostname: config.hostname.clone(),
            namespaces: NamespaceConfig::default(),
            setup_timeout: config.setup_timeout(),
            run_timeout: config.run_timeout(),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stops waiting and kills the child once `flag` is set.
    #[must_use]
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Re-executes `executable` instead of the running binary.
    #[must_use]
    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }

    /// Overrides which namespaces the child is created in.
    #[must_use]
    pub const fn with_namespaces(mut self, namespaces: NamespaceConfig) -> Self {
        self.namespaces = namespaces;
        self
    }

    /// Runs `invocation` confined to `root`, then removes `root`.
    ///
    /// The command's own exit code or terminating signal is the `Ok` value.
    ///
    /// # Errors
    ///
    /// Returns a setup or isolation error if confinement failed,
    /// `CommandNotFound` if the command is absent from the root,
    /// `SetupTimedOut` or `TimedOut` if a deadline passed, `Interrupted` if
    /// the interrupt flag was raised, or an error if the child could not be
    /// started.
    pub fn launch(
        &self,
        id: &InvocationId,
        root: RootDir,
        invocation: &Invocation,
    ) -> Result<ExitOutcome> {
        let result = self.launch_in(id, root.path(), invocation);
        root.teardown();
        match &result {
            Ok(outcome) => tracing::info!(id = %id, %outcome, "invocation finished"),
            Err(e) => tracing::error!(id = %id, error = %e, "invocation failed"),
        }
        result
    }

    fn launch_in(
        &self,
        id: &InvocationId,
        root: &Path,
        invocation: &Invocation,
    ) -> Result<ExitOutcome> {
        let handoff = HandoffChannel::create(self.runtime_dir.join(format!("{id}.handoff")))?;
        let report = HandoffChannel::create(self.runtime_dir.join(format!("{id}.report")))?;
        let mut handoff_rx = handoff.open_reader()?;
        let mut report_rx = report.open_reader()?;

        let confinement = Confinement {
            root: root.to_path_buf(),
            handoff_path: handoff.path().to_path_buf(),
            report_path: report.path().to_path_buf(),
            cgroup_root: self.cgroup_root.clone(),
            limits: self.limits,
            hostname: self.hostname.clone(),
        };
        let argv = self.child_argv(invocation);
        let mut env: Vec<(String, String)> = std::env::vars()
            .filter(|(key, _)| key != CONFINEMENT_ENV)
            .collect();
        env.push((CONFINEMENT_ENV.to_owned(), confinement.to_env_value()?));

        let mut child = process::spawn(&self.executable, &argv, &env, self.namespaces)?;

        let cgroup = match self.await_handoff(&mut child, &mut handoff_rx) {
            Ok(Handoff::Received(name)) => name,
            Ok(Handoff::ChildExited(status)) => {
                let report = read_report(&mut report_rx)?;
                if let Some(raw) = report.as_ref().and_then(ConfinedReport::cgroup) {
                    self.remove_named_cgroup(raw);
                }
                return report.map_or_else(
                    || {
                        Err(CorralError::at_stage(
                            ConfineStage::Handoff,
                            format!("child {status} before publishing its cgroup"),
                        ))
                    },
                    ConfinedReport::into_result,
                );
            }
            Err(e) => {
                // The child may have published its cgroup just before dying.
                child.kill();
                match handoff_rx.try_recv() {
                    Ok(Some(raw)) => self.remove_named_cgroup(&raw),
                    Ok(None) => {}
                    Err(late) => tracing::warn!(error = %late, "failed to read late handoff"),
                }
                return Err(e);
            }
        };
        tracing::info!(id = %id, cgroup = %cgroup, pid = child.pid(), "child joined cgroup");

        let status = match self.await_exit(&mut child) {
            Ok(Exit::Exited(status)) => status,
            Ok(Exit::TimedOut) => {
                let waited = self.run_timeout.unwrap_or_default();
                return self.abandon(&mut child, cgroup, CorralError::TimedOut { waited });
            }
            Ok(Exit::Interrupted) => {
                return self.abandon(&mut child, cgroup, CorralError::Interrupted);
            }
            Err(e) => return self.abandon(&mut child, cgroup, e),
        };
        self.remove_cgroup(cgroup);

        match read_report(&mut report_rx)? {
            Some(report) => report.into_result(),
            None => Err(CorralError::ChildTerminated {
                message: format!("child {status} without reporting a result"),
            }),
        }
    }

    /// Kills a running child, removes its cgroup, and fails with `error`.
    fn abandon(
        &self,
        child: &mut ChildProcess,
        cgroup: CgroupName,
        error: CorralError,
    ) -> Result<ExitOutcome> {
        child.kill();
        self.remove_cgroup(cgroup);
        Err(error)
    }

    /// The `--` keeps the command's own flags away from the child's parser.
    fn child_argv(&self, invocation: &Invocation) -> Vec<String> {
        let mut argv = vec![
            self.executable.display().to_string(),
            CHILD_SUBCOMMAND.to_owned(),
            "--".to_owned(),
            invocation.image.clone(),
            invocation.command.clone(),
        ];
        argv.extend(invocation.args.iter().cloned());
        argv
    }

    /// Polls for the cgroup name until it arrives, the child exits, the
    /// setup deadline passes, or the launch is interrupted.
    fn await_handoff(&self, child: &mut ChildProcess, rx: &mut HandoffReader) -> Result<Handoff> {
        let started = Instant::now();
        loop {
            if let Some(raw) = rx.try_recv()? {
                return received(child, &raw);
            }
            if let Some(status) = child.try_wait()? {
                // The message may have landed between the two checks.
                return match rx.try_recv()? {
                    Some(raw) => received(child, &raw),
                    None => Ok(Handoff::ChildExited(status)),
                };
            }
            if self.interrupted() {
                child.kill();
                return Err(CorralError::Interrupted);
            }
            if started.elapsed() >= self.setup_timeout {
                child.kill();
                return Err(CorralError::SetupTimedOut {
                    waited: started.elapsed(),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Polls for the child's exit until the run deadline, if any, passes or
    /// the launch is interrupted.
    fn await_exit(&self, child: &mut ChildProcess) -> Result<Exit> {
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Exit::Exited(status));
            }
            if self.interrupted() {
                return Ok(Exit::Interrupted);
            }
            if self.run_timeout.is_some_and(|t| started.elapsed() >= t) {
                return Ok(Exit::TimedOut);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Removes a cgroup the parent learned about outside the handoff.
    fn remove_named_cgroup(&self, raw: &str) {
        match CgroupName::parse(raw.trim()) {
            Ok(name) => self.remove_cgroup(name),
            Err(e) => tracing::warn!(error = %e, "ignoring unusable cgroup name"),
        }
    }

    /// Removes the child's cgroup, retrying while its processes drain.
    ///
    /// Best-effort: failure is logged.
    fn remove_cgroup(&self, name: CgroupName) {
        let cgroup = CgroupManager::open(&self.cgroup_root, name);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match cgroup.destroy() {
                Ok(()) => return,
                Err(e) if attempt >= CGROUP_REMOVE_ATTEMPTS => {
                    let remaining = pids::pids_current(cgroup.path()).ok();
                    tracing::warn!(
                        path = %cgroup.path().display(),
                        error = %e,
                        ?remaining,
                        "failed to remove cgroup"
                    );
                    return;
                }
                Err(_) => std::thread::sleep(POLL_INTERVAL),
            }
        }
    }
}

/// Validates a received cgroup name, killing the child if it is unusable.
fn received(child: &mut ChildProcess, raw: &str) -> Result<Handoff> {
    match CgroupName::parse(raw.trim()) {
        Ok(name) => Ok(Handoff::Received(name)),
        Err(e) => {
            child.kill();
            Err(e)
        }
    }
}

/// Reads the child's report once it has exited. The writer is closed by
/// then, so whatever the pipe holds is complete.
fn read_report(rx: &mut HandoffReader) -> Result<Option<ConfinedReport>> {
    rx.try_recv()?
        .map(|raw| {
            serde_json::from_str(&raw).map_err(|e| CorralError::ChildTerminated {
                message: format!("unreadable report from child: {e}"),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_argv_carries_marker_and_command() {
        let launcher = Launcher::new(&CorralConfig::default()).with_executable("/usr/bin/corral");
        let inv = Invocation::new("busybox", "echo", ["hello"]);
        assert_eq!(
            launcher.child_argv(&inv),
            ["/usr/bin/corral", "child", "--", "busybox", "echo", "hello"]
        );
    }

    #[test]
    fn defaults_come_from_config() {
        let config = CorralConfig {
            run_timeout_secs: Some(9),
            ..CorralConfig::default()
        };
        let launcher = Launcher::new(&config);
        assert_eq!(launcher.executable, PathBuf::from("/proc/self/exe"));
        assert_eq!(launcher.run_timeout, Some(Duration::from_secs(9)));
        assert_eq!(launcher.setup_timeout, Duration::from_secs(30));
        assert_eq!(launcher.namespaces, NamespaceConfig::default());
    }
}
