//! Registry manifest documents.
//!
//! A registry answers a manifest request with either a single-image
//! manifest or a list/index pointing at per-platform manifests. Both Docker
//! and OCI flavours share the same JSON shape for the fields used here.

use corral_common::error::{CorralError, Result};
use serde::Deserialize;

/// Docker image manifest, schema 2.
pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker multi-platform manifest list.
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
/// OCI image manifest.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index.
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Every media type sent in the manifest `Accept` header.
pub const ACCEPTED_MEDIA_TYPES: [&str; 4] = [
    DOCKER_MANIFEST_V2,
    DOCKER_MANIFEST_LIST,
    OCI_MANIFEST,
    OCI_INDEX,
];

/// Content descriptor referencing a blob or another manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    #[serde(default)]
    pub media_type: String,
    /// Content digest, `sha256:<hex>`.
    pub digest: String,
    /// Size in bytes, when advertised.
    #[serde(default)]
    pub size: u64,
}

/// OS/architecture pair of a manifest list entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Platform {
    /// Operating system, e.g. `linux`.
    pub os: String,
    /// CPU architecture, e.g. `amd64`.
    pub architecture: String,
    /// Architecture variant, e.g. `v8`.
    #[serde(default)]
    pub variant: Option<String>,
}

/// Manifest list entry: a descriptor plus its platform.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlatformDescriptor {
    /// Descriptor of the platform-specific manifest.
    #[serde(flatten)]
    pub descriptor: Descriptor,
    /// Platform the manifest targets.
    #[serde(default)]
    pub platform: Option<Platform>,
}

/// Raw manifest document with every field either flavour may carry.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestDocument {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    layers: Option<Vec<Descriptor>>,
    #[serde(default)]
    manifests: Option<Vec<PlatformDescriptor>>,
}

/// A parsed manifest response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    /// Single-platform image with its ordered layers, bottom first.
    Image {
        /// Layer blobs in application order.
        layers: Vec<Descriptor>,
    },
    /// Multi-platform list or index.
    List {
        /// Per-platform entries.
        manifests: Vec<PlatformDescriptor>,
    },
}

impl Manifest {
    /// Parses a manifest body.
    ///
    /// `content_type` is the response header and wins over the body's own
    /// `mediaType`. Without either, the body's shape decides.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::Registry` for undecodable bodies or media types
    /// that are not understood.
    pub fn parse(body: &[u8], content_type: Option<&str>) -> Result<Self> {
        let doc: ManifestDocument = serde_json::from_slice(body).map_err(|e| {
            CorralError::Registry {
                message: format!("malformed manifest: {e}"),
            }
        })?;
        let media_type = content_type
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_owned())
            .filter(|ct| ACCEPTED_MEDIA_TYPES.contains(&ct.as_str()))
            .or_else(|| doc.media_type.clone());

        match (media_type.as_deref(), doc.layers, doc.manifests) {
            (Some(DOCKER_MANIFEST_LIST | OCI_INDEX) | None, _, Some(manifests)) => {
                Ok(Self::List { manifests })
            }
            (Some(DOCKER_MANIFEST_V2 | OCI_MANIFEST) | None, Some(layers), _) => {
                Ok(Self::Image { layers })
            }
            (other, _, _) => Err(CorralError::Registry {
                message: format!(
                    "unsupported manifest media type: {}",
                    other.unwrap_or("<none>")
                ),
            }),
        }
    }
}

/// Maps the host architecture onto the registry's naming.
#[must_use]
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        "s390x" => "s390x",
        "riscv64" => "riscv64",
        other => other,
    }
}

/// Picks the entry matching `os`/`arch`, falling back to the first entry.
#[must_use]
pub fn select_platform<'a>(
    manifests: &'a [PlatformDescriptor],
    os: &str,
    arch: &str,
) -> Option<&'a PlatformDescriptor> {
    manifests
        .iter()
        .find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.os == os && p.architecture == arch)
        })
        .or_else(|| manifests.first())
}
