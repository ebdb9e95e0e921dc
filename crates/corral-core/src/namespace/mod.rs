//! Linux namespace selection for the confined child.
//!
//! The parent never enters a namespace itself: it only computes the
//! `clone(2)` flags that place the re-executed child in fresh PID, mount,
//! and UTS namespaces.

pub mod uts;

/// Configuration for which namespaces the child is created in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Isolate PID namespace. The child becomes PID 1.
    pub pid: bool,
    /// Isolate mount namespace.
    pub mount: bool,
    /// Isolate UTS (hostname) namespace.
    pub uts: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            pid: true,
            mount: true,
            uts: true,
        }
    }
}

#[cfg(target_os = "linux")]
impl NamespaceConfig {
    /// Returns the `clone(2)` flags requesting the configured namespaces.
    #[must_use]
    pub fn clone_flags(&self) -> nix::sched::CloneFlags {
        use nix::sched::CloneFlags;

        let mut flags = CloneFlags::empty();
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        tracing::debug!(config = ?self, ?flags, "namespace flags computed");
        flags
    }
}
