//! The image provider seam used by the runtime.

use std::path::Path;

use corral_common::config::RegistryConfig;
use corral_common::error::{CorralError, Result};

use crate::registry::RegistryClient;
use crate::source::{ImageSource, resolve_source};

/// Fills a destination directory with an extracted root filesystem.
pub trait ImageProvider {
    /// Populates `destination` with the image named by `reference`.
    ///
    /// On success `destination` holds the fully extracted root filesystem.
    ///
    /// # Errors
    ///
    /// Any failure is fatal for the invocation; callers do not retry.
    fn populate(&self, reference: &str, destination: &Path) -> Result<()>;
}

/// Provider dispatching to local sources or a registry.
#[derive(Debug, Clone, Default)]
pub struct ImagePuller {
    registry: RegistryConfig,
}

impl ImagePuller {
    /// Creates a provider pulling remote images from the given registry.
    #[must_use]
    pub const fn new(registry: RegistryConfig) -> Self {
        Self { registry }
    }
}

impl ImageProvider for ImagePuller {
    fn populate(&self, reference: &str, destination: &Path) -> Result<()> {
        if !destination.is_dir() {
            return Err(CorralError::NotFound {
                kind: "root directory",
                id: destination.display().to_string(),
            });
        }
        match resolve_source(reference)? {
            ImageSource::File(dir) => crate::source::copy_tree(&dir, destination),
            ImageSource::Tar(archive) => crate::layer::apply_layer(&archive, destination),
            ImageSource::Registry(image) => {
                RegistryClient::new(self.registry.clone())?.pull(&image, destination)
            }
        }?;
        tracing::info!(image = reference, destination = %destination.display(), "root populated");
        Ok(())
    }
}
