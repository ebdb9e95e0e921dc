//! # corral-image
//!
//! Populates an invocation root with an extracted image.
//!
//! Handles:
//! - **References**: `name[:tag]` and `name@sha256:…` parsing.
//! - **Sources**: `file://` (prepared rootfs), `tar://` (archive), and
//!   registry references.
//! - **Registry**: bearer-token auth, manifest and manifest-list
//!   resolution, blob download.
//! - **Hashing**: SHA-256 content verification.
//! - **Layers**: ordered extraction with whiteout handling.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod hash;
pub mod layer;
pub mod manifest;
pub mod provider;
pub mod reference;
pub mod registry;
pub mod source;

pub use provider::{ImageProvider, ImagePuller};
