//! The invocation pipeline: prepare root, populate, launch, tear down.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use corral_common::config::CorralConfig;
use corral_common::error::{CorralError, Result};
use corral_common::types::{ExitOutcome, InvocationId};
use corral_core::filesystem::rootfs::RootDir;
use corral_image::ImageProvider;

use crate::invocation::Invocation;
use crate::launcher::Launcher;

/// Runs invocations end to end.
///
/// Each invocation gets its own root directory under the configured rootfs
/// directory. The root is removed when the invocation ends, whether the
/// image provider, the launch, or the command failed.
#[derive(Debug, Clone)]
pub struct Engine {
    config: CorralConfig,
    launcher: Launcher,
}

impl Engine {
    /// Creates an engine launching through the running binary.
    #[must_use]
    pub fn new(config: CorralConfig) -> Self {
        let launcher = Launcher::new(&config);
        Self { config, launcher }
    }

    /// Creates an engine with a custom launcher.
    #[must_use]
    pub const fn with_launcher(config: CorralConfig, launcher: Launcher) -> Self {
        Self { config, launcher }
    }

    /// Stops the invocation once `flag` is set, killing its child and
    /// cleaning up as on any other failure.
    #[must_use]
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.launcher = self.launcher.with_interrupt(flag);
        self
    }

    /// Runs one invocation and returns how its command ended.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be prepared, the provider fails,
    /// or the launch fails. Provider failures are not retried. An interrupt
    /// that arrives while the provider runs takes effect once it returns.
    pub fn run(
        &self,
        invocation: &Invocation,
        provider: &dyn ImageProvider,
    ) -> Result<ExitOutcome> {
        let id = InvocationId::generate();
        tracing::info!(
            id = %id,
            image = %invocation.image,
            command = %invocation.command,
            "starting invocation"
        );
        let root = RootDir::prepare(&self.config.rootfs_dir, &id)?;
        if let Err(e) = provider.populate(&invocation.image, root.path()) {
            tracing::error!(id = %id, image = %invocation.image, error = %e, "image provider failed");
            root.teardown();
            return Err(e);
        }
        if self.launcher.interrupted() {
            tracing::warn!(id = %id, "interrupted before launch");
            root.teardown();
            return Err(CorralError::Interrupted);
        }
        self.launcher.launch(&id, root, invocation)
    }
}
