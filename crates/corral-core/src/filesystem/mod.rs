//! Filesystem management for container isolation.
//!
//! Provides the ephemeral invocation root, `chroot(2)` entry, and the
//! private `/proc` mount the confined command sees.

pub mod chroot;
pub mod mount;
pub mod rootfs;
