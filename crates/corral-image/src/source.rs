//! Image source resolution.
//!
//! `file://` points at an already-extracted root filesystem, `tar://` at a
//! single (optionally gzipped) archive. Anything else is a registry
//! reference.

use std::path::{Path, PathBuf};

use corral_common::error::{CorralError, Result};

use crate::reference::ImageReference;

/// Where an image's content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Local directory (`file:///path/to/rootfs`).
    File(PathBuf),
    /// Local tar archive (`tar:///path/to/image.tar`).
    Tar(PathBuf),
    /// Image in a remote registry.
    Registry(ImageReference),
}

/// Resolves a user-supplied image string into an [`ImageSource`].
///
/// # Errors
///
/// Returns `CorralError::NotFound` if a local source does not exist, or
/// `CorralError::Config` if a registry reference is malformed.
pub fn resolve_source(uri: &str) -> Result<ImageSource> {
    if let Some(path_str) = uri.strip_prefix("file://") {
        let path = PathBuf::from(path_str);
        if !path.is_dir() {
            return Err(CorralError::NotFound {
                kind: "image directory",
                id: path_str.to_string(),
            });
        }
        tracing::info!(path = %path.display(), "resolved file:// source");
        Ok(ImageSource::File(path))
    } else if let Some(path_str) = uri.strip_prefix("tar://") {
        let path = PathBuf::from(path_str);
        if !path.is_file() {
            return Err(CorralError::NotFound {
                kind: "tar archive",
                id: path_str.to_string(),
            });
        }
        tracing::info!(path = %path.display(), "resolved tar:// source");
        Ok(ImageSource::Tar(path))
    } else {
        let reference = ImageReference::parse(uri)?;
        tracing::info!(image = %reference, "resolved registry source");
        Ok(ImageSource::Registry(reference))
    }
}

/// Recursively copies `source` into `destination`, keeping symlinks as
/// symlinks and preserving permission bits.
///
/// # Errors
///
/// Returns an error if any entry cannot be read or created.
pub fn copy_tree(source: &Path, destination: &Path) -> Result<()> {
    std::fs::create_dir_all(destination).map_err(io_err(destination))?;
    for entry in std::fs::read_dir(source).map_err(io_err(source))? {
        let entry = entry.map_err(io_err(source))?;
        let from = entry.path();
        let to = destination.join(entry.file_name());
        let meta = std::fs::symlink_metadata(&from).map_err(io_err(&from))?;
        let kind = meta.file_type();

        if kind.is_symlink() {
            let link = std::fs::read_link(&from).map_err(io_err(&from))?;
            std::os::unix::fs::symlink(&link, &to).map_err(io_err(&to))?;
        } else if kind.is_dir() {
            copy_tree(&from, &to)?;
            std::fs::set_permissions(&to, meta.permissions()).map_err(io_err(&to))?;
        } else if kind.is_file() {
            std::fs::copy(&from, &to).map_err(io_err(&to))?;
        } else {
            tracing::debug!(path = %from.display(), "skipping special file");
        }
    }
    Ok(())
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CorralError {
    let path = path.to_path_buf();
    move |source| CorralError::Io { path, source }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn file_source_requires_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let uri = format!("file://{}", dir.path().display());
        assert!(matches!(
            resolve_source(&uri).expect("resolve"),
            ImageSource::File(_)
        ));
        assert!(matches!(
            resolve_source("file:///nonexistent/rootfs"),
            Err(CorralError::NotFound { .. })
        ));
    }

    #[test]
    fn tar_source_requires_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tar_path = dir.path().join("image.tar");
        std::fs::write(&tar_path, b"fake tar").expect("write");
        let uri = format!("tar://{}", tar_path.display());
        assert!(matches!(
            resolve_source(&uri).expect("resolve"),
            ImageSource::Tar(_)
        ));
        assert!(resolve_source("tar:///nonexistent/archive.tar").is_err());
    }

    #[test]
    fn bare_name_is_a_registry_reference() {
        let ImageSource::Registry(reference) = resolve_source("busybox:1.36").expect("resolve")
        else {
            panic!("expected registry source");
        };
        assert_eq!(reference.repository, "library/busybox");
    }

    #[test]
    fn malformed_reference_is_rejected() {
        assert!(matches!(
            resolve_source("Not A Reference"),
            Err(CorralError::Config { .. })
        ));
    }

    #[test]
    fn copy_tree_keeps_symlinks_and_modes() {
        let src = tempfile::tempdir().expect("src");
        let dst = tempfile::tempdir().expect("dst");
        std::fs::create_dir_all(src.path().join("bin")).expect("mkdir");
        let tool = src.path().join("bin/busybox");
        std::fs::write(&tool, b"elf").expect("write");
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        std::os::unix::fs::symlink("busybox", src.path().join("bin/sh")).expect("symlink");

        let target = dst.path().join("root");
        copy_tree(src.path(), &target).expect("copy");

        let copied = target.join("bin/busybox");
        assert_eq!(std::fs::read(&copied).expect("read"), b"elf");
        let mode = std::fs::metadata(&copied).expect("stat").permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        let link = std::fs::read_link(target.join("bin/sh")).expect("readlink");
        assert_eq!(link, PathBuf::from("busybox"));
    }
}
