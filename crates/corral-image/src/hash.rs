//! SHA-256 content verification.
//!
//! Validates integrity of downloaded layer blobs.

use std::io::Read;
use std::path::Path;

use corral_common::error::{CorralError, Result};
use corral_common::types::Sha256Hash;
use sha2::{Digest, Sha256};

/// Computes the SHA-256 hash of a file, streaming its content.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn hash_file(path: &Path) -> Result<Sha256Hash> {
    tracing::debug!(path = %path.display(), "computing SHA-256 hash");
    let io_err = |e| CorralError::Io {
        path: path.to_path_buf(),
        source: e,
    };
    let mut file = std::fs::File::open(path).map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Sha256Hash::from_hex(format!("{:x}", hasher.finalize()))
}

/// Validates that a file matches the expected SHA-256 hash.
///
/// # Errors
///
/// Returns `CorralError::HashMismatch` if the hashes do not match.
pub fn validate_hash(path: &Path, expected: &Sha256Hash) -> Result<()> {
    tracing::debug!(path = %path.display(), expected = %expected, "validating SHA-256 hash");
    let actual = hash_file(path)?;
    if actual != *expected {
        return Err(CorralError::HashMismatch {
            resource: path.display().to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}
