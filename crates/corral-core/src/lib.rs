//! # corral-core
//!
//! Low-level Linux isolation primitives for the Corral launcher.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: PID, mount, and UTS isolation flags and hostname setup.
//! - **Cgroups v2**: per-invocation subgroups with a process-count limit.
//! - **Filesystem**: the ephemeral invocation root, `chroot`, and `/proc`.
//! - **Handoff**: the one-shot named pipe between the confined child and
//!   its parent.
//!
//! System calls go through `nix`; every wrapper maps failures into
//! `CorralError` and logs what it changed.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cgroup;
pub mod filesystem;
pub mod handoff;
pub mod namespace;
