//! Filesystem layer application.
//!
//! A layer is a tar archive, optionally gzip-compressed, applied on top of
//! whatever earlier layers left in the target. Entries overwrite existing
//! files, and OCI whiteout markers delete content from earlier layers:
//! `.wh.<name>` removes `<name>`, `.wh..wh..opq` empties its directory.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use corral_common::error::{CorralError, Result};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Compression detected from an archive's leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    None,
    Gzip,
}

/// Applies the layer archive at `archive_path` onto `target`.
///
/// The target directory is created if needed. Ownership recorded in the
/// archive is not restored; permissions are.
///
/// # Errors
///
/// Returns an error if the archive cannot be read, uses an unsupported
/// compression, or an entry cannot be written.
pub fn apply_layer(archive_path: &Path, target: &Path) -> Result<()> {
    tracing::info!(
        archive = %archive_path.display(),
        target = %target.display(),
        "applying layer"
    );

    std::fs::create_dir_all(target).map_err(|e| CorralError::Io {
        path: target.to_path_buf(),
        source: e,
    })?;

    let archive_err = |e| CorralError::Io {
        path: archive_path.to_path_buf(),
        source: e,
    };
    let mut file = File::open(archive_path).map_err(archive_err)?;
    let compression = detect_compression(&mut file).map_err(archive_err)?.ok_or_else(|| {
        CorralError::Config {
            message: format!(
                "{}: zstd-compressed layers are not supported",
                archive_path.display()
            ),
        }
    })?;

    let applied = match compression {
        Compression::Gzip => unpack(tar::Archive::new(flate2::read::GzDecoder::new(file)), target),
        Compression::None => unpack(tar::Archive::new(file), target),
    };
    let (entries, whiteouts) = applied.map_err(archive_err)?;
    tracing::debug!(entries, whiteouts, "layer applied");
    Ok(())
}

/// Sniffs the magic bytes and rewinds. `None` means zstd.
fn detect_compression(file: &mut File) -> std::io::Result<Option<Compression>> {
    let mut magic = [0_u8; 4];
    let mut filled = 0;
    while filled < magic.len() {
        match file.read(&mut magic[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    file.seek(SeekFrom::Start(0))?;

    if filled >= 2 && magic[..2] == GZIP_MAGIC {
        Ok(Some(Compression::Gzip))
    } else if filled == 4 && magic == ZSTD_MAGIC {
        Ok(None)
    } else {
        Ok(Some(Compression::None))
    }
}

fn unpack<R: Read>(mut archive: tar::Archive<R>, target: &Path) -> std::io::Result<(usize, usize)> {
    archive.set_overwrite(true);
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(false);
    archive.set_unpack_xattrs(false);

    let root = target.canonicalize()?;
    let mut entries = 0;
    let mut whiteouts = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let Some(relative) = sanitize(&path) else {
            tracing::warn!(entry = %path.display(), "skipping layer entry outside the root");
            continue;
        };
        // Earlier layers may have planted symlinks on the way to this entry.
        let Some(destination) = resolve_within(&root, &relative)? else {
            tracing::warn!(entry = %path.display(), "skipping layer entry behind an escaping symlink");
            continue;
        };

        let file_name = relative
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_owned();
        if let Some(hidden) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            let dir = destination.parent().unwrap_or(&root);
            if file_name == OPAQUE_WHITEOUT {
                clear_dir(dir)?;
            } else {
                remove_path(&dir.join(hidden))?;
            }
            whiteouts += 1;
            continue;
        }

        if !entry.header().entry_type().is_dir() && is_real_dir(&destination) {
            std::fs::remove_dir_all(&destination)?;
        }
        entry.unpack_in(&root)?;
        entries += 1;
    }
    Ok((entries, whiteouts))
}

/// Resolves where `relative` lands under `root`, following symlinks that
/// already exist along its parent directories.
///
/// Returns `None` if an existing ancestor resolves outside `root`, or is a
/// dangling symlink. `root` must be canonical.
fn resolve_within(root: &Path, relative: &Path) -> std::io::Result<Option<PathBuf>> {
    let Some(name) = relative.file_name() else {
        return Ok(None);
    };
    let mut ancestor = relative.parent().map_or_else(PathBuf::new, Path::to_path_buf);
    let mut missing = Vec::new();
    let resolved = loop {
        match root.join(&ancestor).canonicalize() {
            Ok(real) => break real,
            Err(e) if e.kind() == ErrorKind::NotFound && !ancestor.as_os_str().is_empty() => {
                if std::fs::symlink_metadata(root.join(&ancestor)).is_ok() {
                    return Ok(None);
                }
                if let Some(last) = ancestor.file_name() {
                    missing.push(last.to_owned());
                }
                let _ = ancestor.pop();
            }
            Err(e) => return Err(e),
        }
    };
    if !resolved.starts_with(root) {
        return Ok(None);
    }
    let mut destination = resolved;
    destination.extend(missing.iter().rev());
    destination.push(name);
    Ok(Some(destination))
}

/// Strips `./` prefixes and rejects absolute or parent-relative paths.
fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!clean.as_os_str().is_empty()).then_some(clean)
}

fn is_real_dir(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok_and(|m| m.is_dir())
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    let result = if is_real_dir(path) {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn clear_dir(dir: &Path) -> std::io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        remove_path(&entry?.path())?;
    }
    Ok(())
}
