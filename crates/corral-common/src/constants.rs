//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Default base directory for Corral data when running as root.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/corral";

/// Returns the data directory, preferring `$HOME/.corral` when it can be
/// created, falling back to `/var/lib/corral`.
fn resolve_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let user_dir = PathBuf::from(home).join(".corral");
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    PathBuf::from(SYSTEM_DATA_DIR)
}

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved data directory for this session.
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(resolve_data_dir)
}

/// Returns the default directory under which invocation roots are created.
pub fn default_rootfs_dir() -> PathBuf {
    data_dir().join("rootfs")
}

/// Returns the default directory holding per-invocation handoff pipes.
pub fn default_runtime_dir() -> PathBuf {
    data_dir().join("run")
}

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Name of the parent cgroup that holds every invocation's subgroup.
pub const CGROUP_PARENT: &str = "corral";

/// Length of a generated cgroup name.
pub const CGROUP_NAME_LEN: usize = 32;

/// Alphabet cgroup names are drawn from.
pub const CGROUP_NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Default process-count limit written to `pids.max`.
pub const DEFAULT_PIDS_MAX: u64 = 20;

/// Hostname set inside the UTS namespace.
pub const DEFAULT_HOSTNAME: &str = "container";

/// Default bound on the wait for the child to publish its cgroup.
pub const DEFAULT_SETUP_TIMEOUT_SECS: u64 = 30;

/// Executable re-invoked to enter confined mode.
pub const SELF_EXE: &str = "/proc/self/exe";

/// Subcommand marking the internal confined entry point.
pub const CHILD_SUBCOMMAND: &str = "child";

/// Environment variable carrying the serialized confinement to the child.
pub const CONFINEMENT_ENV: &str = "CORRAL_CONFINEMENT";

/// Exit code of the confined child when setup or isolation fails.
pub const CONFINE_FAILURE_EXIT_CODE: i32 = 125;

/// Exit code of `corral run` when interrupted (`128 + SIGINT`).
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Default registry token endpoint.
pub const DEFAULT_AUTH_URL: &str = "https://auth.docker.io/token";

/// Service name requested from the token endpoint.
pub const DEFAULT_AUTH_SERVICE: &str = "registry.docker.io";

/// Default registry API base URL.
pub const DEFAULT_REGISTRY_URL: &str = "https://registry-1.docker.io";

/// Tag used when an image reference carries none.
pub const DEFAULT_IMAGE_TAG: &str = "latest";

/// Namespace prepended to single-component image names.
pub const DEFAULT_IMAGE_NAMESPACE: &str = "library";

/// SHA-256 digest length in hex characters.
pub const SHA256_HEX_LENGTH: usize = 64;

/// Maximum number of layers in an image.
pub const MAX_IMAGE_LAYERS: usize = 128;
