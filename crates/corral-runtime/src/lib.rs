//! Invocation pipeline for the Corral runtime.
//!
//! The [`engine::Engine`] prepares a root, asks an image provider to fill
//! it, and hands it to the [`launcher::Launcher`], which re-executes the
//! binary in `child` mode inside new namespaces. The child side lives in
//! [`confine`].

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod confine;
pub mod engine;
pub mod invocation;
pub mod launcher;
pub mod process;

pub use engine::Engine;
pub use invocation::{Confinement, Invocation};
pub use launcher::Launcher;
