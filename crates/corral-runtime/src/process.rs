//! Spawning the namespaced child and collecting its status.
//!
//! The child is created with `clone(2)` so the requested namespaces apply
//! to it from birth; with a new PID namespace it becomes PID 1 there. The
//! callback does nothing but `execve(2)`: the strings and pointer arrays it
//! needs are built before the clone, since the parent may be multithreaded
//! and the child must not allocate.

use std::path::Path;
use std::time::{Duration, Instant};

use corral_common::error::{CorralError, Result};
use corral_common::types::ExitOutcome;
use corral_core::namespace::NamespaceConfig;

/// Interval between non-blocking status checks.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A child started by [`spawn`].
#[derive(Debug)]
pub struct ChildProcess {
    pid: i32,
    reaped: bool,
}

impl ChildProcess {
    /// Returns the child's pid as seen from the parent.
    #[must_use]
    pub const fn pid(&self) -> i32 {
        self.pid
    }

    /// Returns the outcome if the child has exited, without blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the status cannot be queried.
    pub fn try_wait(&mut self) -> Result<Option<ExitOutcome>> {
        let outcome = try_wait_pid(self.pid)?;
        if outcome.is_some() {
            self.reaped = true;
        }
        Ok(outcome)
    }

    /// Waits for the child to exit, up to `timeout` if one is given.
    ///
    /// Returns `Ok(None)` if the deadline passed first.
    ///
    /// # Errors
    ///
    /// Returns an error if the status cannot be queried.
    pub fn wait_timeout(&mut self, timeout: Option<Duration>) -> Result<Option<ExitOutcome>> {
        let started = Instant::now();
        loop {
            if let Some(outcome) = self.try_wait()? {
                return Ok(Some(outcome));
            }
            if timeout.is_some_and(|t| started.elapsed() >= t) {
                return Ok(None);
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Kills the child with `SIGKILL` and reaps it.
    ///
    /// With a PID namespace, the kernel then kills every process left in it.
    pub fn kill(&mut self) {
        if self.reaped {
            return;
        }
        kill_pid(self.pid);
        match self.wait_timeout(Some(Duration::from_secs(5))) {
            Ok(Some(outcome)) => tracing::debug!(pid = self.pid, %outcome, "killed child reaped"),
            Ok(None) => tracing::warn!(pid = self.pid, "killed child did not exit"),
            Err(e) => tracing::warn!(pid = self.pid, error = %e, "failed to reap killed child"),
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Starts `executable` with `argv` and `env` in fresh namespaces.
///
/// The child inherits the parent's stdin, stdout, and stderr.
///
/// # Errors
///
/// Returns `CorralError::PermissionDenied` if the kernel refuses the
/// namespaces, or another error if an argument cannot be passed to
/// `execve(2)`.
#[cfg(target_os = "linux")]
pub fn spawn(
    executable: &Path,
    argv: &[String],
    env: &[(String, String)],
    namespaces: NamespaceConfig,
) -> Result<ChildProcess> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    use nix::sched::CloneFlags;

    const STACK_SIZE: usize = 1024 * 1024;

    let to_cstring = |raw: &[u8]| {
        CString::new(raw).map_err(|_| CorralError::Config {
            message: format!(
                "argument contains a NUL byte: {:?}",
                String::from_utf8_lossy(raw)
            ),
        })
    };
    let exe = to_cstring(executable.as_os_str().as_bytes())?;
    let args = argv
        .iter()
        .map(|a| to_cstring(a.as_bytes()))
        .collect::<Result<Vec<_>>>()?;
    let vars = env
        .iter()
        .map(|(k, v)| to_cstring(format!("{k}={v}").as_bytes()))
        .collect::<Result<Vec<_>>>()?;

    // execve(2) wants NULL-terminated pointer arrays; build them here so
    // the child never allocates.
    let argv_ptrs = null_terminated(&args);
    let envp_ptrs = null_terminated(&vars);

    let flags: CloneFlags = namespaces.clone_flags();
    let mut stack = vec![0_u8; STACK_SIZE];
    let callback = Box::new(|| -> isize {
        // SAFETY: every pointer refers to a CString or array owned by the
        // parent's frame, which the clone sees unchanged in its copy of the
        // address space. Both arrays end in NULL.
        unsafe {
            let _ = libc::execve(exe.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
            libc::_exit(127)
        }
    });

    // SAFETY: the callback makes no allocation and calls only `execve` and
    // `_exit`, both async-signal-safe, so it cannot deadlock on a lock held
    // by another parent thread at the time of the clone. The stack outlives
    // the call because the child either execs or exits.
    let pid = unsafe {
        nix::sched::clone(
            callback,
            &mut stack,
            flags,
            Some(nix::sys::signal::Signal::SIGCHLD as i32),
        )
    }
    .map_err(|e| match e {
        nix::errno::Errno::EPERM => CorralError::PermissionDenied {
            message: format!("creating namespaces {flags:?} requires CAP_SYS_ADMIN"),
        },
        other => CorralError::Io {
            path: executable.to_path_buf(),
            source: other.into(),
        },
    })?;

    tracing::info!(pid = pid.as_raw(), executable = %executable.display(), ?flags, "child spawned");
    Ok(ChildProcess {
        pid: pid.as_raw(),
        reaped: false,
    })
}

/// Starts `executable` in fresh namespaces.
///
/// # Errors
///
/// Always returns an error: namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn spawn(
    _executable: &Path,
    _argv: &[String],
    _env: &[(String, String)],
    _namespaces: NamespaceConfig,
) -> Result<ChildProcess> {
    Err(CorralError::Config {
        message: "Linux required for native container operations".into(),
    })
}

/// Borrows `strings` as the NULL-terminated array `execve(2)` expects.
#[cfg(target_os = "linux")]
fn null_terminated(strings: &[std::ffi::CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

#[cfg(target_os = "linux")]
fn try_wait_pid(pid: i32) -> Result<Option<ExitOutcome>> {
    use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};

    match waitpid(nix::unistd::Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => Ok(Some(ExitOutcome::Exited(code))),
        Ok(WaitStatus::Signaled(_, signal, _)) => Ok(Some(ExitOutcome::Signaled(signal as i32))),
        Ok(_) | Err(nix::errno::Errno::EINTR) => Ok(None),
        Err(e) => Err(CorralError::ChildTerminated {
            message: format!("waitpid({pid}) failed: {e}"),
        }),
    }
}

#[cfg(not(target_os = "linux"))]
fn try_wait_pid(_pid: i32) -> Result<Option<ExitOutcome>> {
    Err(CorralError::Config {
        message: "Linux required for native container operations".into(),
    })
}

#[cfg(target_os = "linux")]
fn kill_pid(pid: i32) {
    use nix::sys::signal::{Signal, kill};

    match kill(nix::unistd::Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, error = %e, "failed to kill child"),
    }
}

#[cfg(not(target_os = "linux"))]
const fn kill_pid(_pid: i32) {}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    fn no_namespaces() -> NamespaceConfig {
        NamespaceConfig {
            pid: false,
            mount: false,
            uts: false,
        }
    }

    fn sh(script: &str) -> ChildProcess {
        let argv = ["sh", "-c", script].map(String::from);
        spawn(Path::new("/bin/sh"), &argv, &[], no_namespaces()).expect("spawn")
    }

    #[test]
    fn exit_code_is_reported() {
        let mut child = sh("exit 7");
        let outcome = child.wait_timeout(Some(Duration::from_secs(10))).expect("wait");
        assert_eq!(outcome, Some(ExitOutcome::Exited(7)));
    }

    #[test]
    fn signal_is_reported() {
        let mut child = sh("kill -TERM $$");
        let outcome = child.wait_timeout(Some(Duration::from_secs(10))).expect("wait");
        assert_eq!(outcome, Some(ExitOutcome::Signaled(libc::SIGTERM)));
    }

    #[test]
    fn wait_gives_up_at_deadline_and_kill_reaps() {
        let mut child = sh("sleep 30");
        let outcome = child
            .wait_timeout(Some(Duration::from_millis(50)))
            .expect("wait");
        assert!(outcome.is_none());
        child.kill();
        assert!(child.reaped);
    }

    #[test]
    fn argv_and_env_reach_the_executable() {
        let argv = ["sh", "-c", r#"[ "$1" = "-x y" ] && [ "$GREETING" = hi ]"#, "sh", "-x y"]
            .map(String::from);
        let env = [("GREETING".to_owned(), "hi".to_owned())];
        let mut child = spawn(Path::new("/bin/sh"), &argv, &env, no_namespaces()).expect("spawn");
        let outcome = child.wait_timeout(Some(Duration::from_secs(10))).expect("wait");
        assert_eq!(outcome, Some(ExitOutcome::Exited(0)));
    }

    #[test]
    fn pointer_arrays_end_in_null() {
        let strings = ["a", "b"].map(|s| std::ffi::CString::new(s).expect("no NUL"));
        let ptrs = null_terminated(&strings);
        assert_eq!(ptrs.len(), 3);
        assert_eq!(ptrs[0], strings[0].as_ptr());
        assert!(ptrs[2].is_null());
    }

    #[test]
    fn missing_executable_exits_127() {
        let argv = vec!["nope".to_owned()];
        let mut child = spawn(Path::new("/nonexistent/exe"), &argv, &[], no_namespaces())
            .expect("clone succeeds, exec fails");
        let outcome = child.wait_timeout(Some(Duration::from_secs(10))).expect("wait");
        assert_eq!(outcome, Some(ExitOutcome::Exited(127)));
    }

    #[test]
    fn nul_in_argument_is_rejected() {
        let argv = vec!["a\0b".to_owned()];
        assert!(matches!(
            spawn(Path::new("/bin/true"), &argv, &[], no_namespaces()),
            Err(CorralError::Config { .. })
        ));
    }
}
