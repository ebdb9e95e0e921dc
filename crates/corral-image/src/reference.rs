//! Image reference parsing.
//!
//! Accepts `name`, `name:tag`, and `name@sha256:<hex>`. Single-component
//! names live in the `library/` namespace, and a leading `docker.io/` is
//! dropped since the registry endpoint is configured separately.

use std::fmt;

use corral_common::constants::{DEFAULT_IMAGE_NAMESPACE, DEFAULT_IMAGE_TAG};
use corral_common::error::{CorralError, Result};
use corral_common::types::Sha256Hash;

/// Version selector of an image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// A mutable tag such as `latest`.
    Tag(String),
    /// An immutable content digest.
    Digest(Sha256Hash),
}

/// Parsed reference to an image in a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Repository path, e.g. `library/alpine`.
    pub repository: String,
    /// Tag or digest to fetch.
    pub selector: Selector,
}

impl ImageReference {
    /// Parses a user-supplied image reference.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::Config` if the name is empty or contains
    /// characters a registry would reject.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (name, selector) = if let Some((name, digest)) = raw.split_once('@') {
            (name, Selector::Digest(Sha256Hash::from_digest(digest)?))
        } else {
            match raw.rfind(':') {
                Some(idx) if !raw[idx..].contains('/') => {
                    (&raw[..idx], Selector::Tag(raw[idx + 1..].to_owned()))
                }
                _ => (raw, Selector::Tag(DEFAULT_IMAGE_TAG.to_owned())),
            }
        };

        if let Selector::Tag(tag) = &selector {
            if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)) {
                return Err(CorralError::Config {
                    message: format!("invalid image tag in {raw:?}"),
                });
            }
        }

        let name = name.strip_prefix("docker.io/").unwrap_or(name);
        let valid_name = !name.is_empty()
            && name
                .split('/')
                .all(|part| !part.is_empty() && part.chars().all(is_name_char));
        if !valid_name {
            return Err(CorralError::Config {
                message: format!("invalid image name in {raw:?}"),
            });
        }

        let repository = if name.contains('/') {
            name.to_owned()
        } else {
            format!("{DEFAULT_IMAGE_NAMESPACE}/{name}")
        };
        Ok(Self {
            repository,
            selector,
        })
    }

    /// Returns the tag or digest as used in a manifest URL.
    #[must_use]
    pub fn reference(&self) -> String {
        match &self.selector {
            Selector::Tag(tag) => tag.clone(),
            Selector::Digest(digest) => digest.to_string(),
        }
    }
}

const fn is_name_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-')
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.selector {
            Selector::Tag(tag) => write!(f, "{}:{tag}", self.repository),
            Selector::Digest(digest) => write!(f, "{}@{digest}", self.repository),
        }
    }
}
