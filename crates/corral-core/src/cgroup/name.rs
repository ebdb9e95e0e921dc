//! Randomly generated cgroup names.
//!
//! Names are 32 characters drawn from `[a-z0-9]`. The generator is seeded
//! from the clock, the process id, and a per-process counter; that is enough
//! to keep names of concurrent or back-to-back invocations apart, but it is
//! not a source of secrets.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use corral_common::constants::{CGROUP_NAME_ALPHABET, CGROUP_NAME_LEN};
use corral_common::error::{CorralError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

static SEED_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Name of an invocation's cgroup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CgroupName(String);

impl CgroupName {
    /// Generates a fresh name from a time-seeded generator.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = StdRng::seed_from_u64(time_seed());
        Self::generate_with(&mut rng)
    }

    /// Generates a name from the given random source.
    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let name = (0..CGROUP_NAME_LEN)
            .map(|_| {
                let idx = rng.gen_range(0..CGROUP_NAME_ALPHABET.len());
                char::from(CGROUP_NAME_ALPHABET[idx])
            })
            .collect();
        Self(name)
    }

    /// Validates a name received from another process.
    ///
    /// The name becomes a path component, so anything other than exactly
    /// 32 characters of `[a-z0-9]` is rejected.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::Config` if the name has the wrong length or
    /// contains characters outside the alphabet.
    pub fn parse(raw: &str) -> Result<Self> {
        let well_formed = raw.len() == CGROUP_NAME_LEN
            && raw.bytes().all(|b| CGROUP_NAME_ALPHABET.contains(&b));
        if !well_formed {
            return Err(CorralError::Config {
                message: format!("malformed cgroup name: {raw:?}"),
            });
        }
        Ok(Self(raw.to_owned()))
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CgroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn time_seed() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64);
    let count = SEED_COUNTER.fetch_add(1, Ordering::Relaxed);
    nanos ^ (u64::from(std::process::id()) << 32) ^ count.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}
