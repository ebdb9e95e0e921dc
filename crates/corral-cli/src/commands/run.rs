//! `corral run`: run a command inside an image and propagate its status.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::Args;
use corral_common::config::CorralConfig;
use corral_common::constants::INTERRUPTED_EXIT_CODE;
use corral_common::error::CorralError;
use corral_image::ImagePuller;
use corral_runtime::{Engine, Invocation};

/// Arguments for the `run` command.
///
/// Options go before the image. Everything after the image belongs to the
/// command and is passed through untouched, including `-h` and flags that
/// look like corral's own.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Image: a registry reference, `file://<rootfs dir>`, or `tar://<archive>`.
    pub image: String,

    /// Command to execute inside the image, then its arguments.
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "COMMAND"
    )]
    pub argv: Vec<String>,

    /// JSON configuration file.
    #[arg(long, env = "CORRAL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Maximum number of processes in the container's cgroup.
    #[arg(long)]
    pub pids_max: Option<u64>,

    /// Hostname inside the container.
    #[arg(long)]
    pub hostname: Option<String>,

    /// Seconds to wait for the container to finish setting up.
    #[arg(long, value_name = "SECS")]
    pub setup_timeout: Option<u64>,

    /// Seconds the command may run before it is killed.
    #[arg(long, value_name = "SECS")]
    pub run_timeout: Option<u64>,
}

impl RunArgs {
    /// Loads the configuration file, if any, and applies flag overrides.
    fn resolve_config(&self) -> anyhow::Result<CorralConfig> {
        let mut config = match &self.config {
            Some(path) => CorralConfig::load(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?,
            None => CorralConfig::default(),
        };
        if let Some(pids_max) = self.pids_max {
            config.limits.pids_max = pids_max;
        }
        if let Some(hostname) = &self.hostname {
            config.hostname.clone_from(hostname);
        }
        if let Some(secs) = self.setup_timeout {
            config.setup_timeout_secs = secs;
        }
        if self.run_timeout.is_some() {
            config.run_timeout_secs = self.run_timeout;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    fn invocation(self) -> anyhow::Result<Invocation> {
        let mut argv = self.argv.into_iter();
        let command = argv.next().context("no command given")?;
        Ok(Invocation::new(self.image, command, argv))
    }
}

/// Executes the `run` command.
///
/// Returns the confined command's exit code, `128 + signal` if it was
/// killed by a signal, or 130 if corral itself was interrupted.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the image cannot be
/// populated, or confinement fails.
pub fn execute(args: RunArgs) -> anyhow::Result<i32> {
    let config = args.resolve_config()?;
    let invocation = args.invocation()?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("failed to install the interrupt handler")?;

    let provider = ImagePuller::new(config.registry.clone());
    let engine = Engine::new(config).with_interrupt(interrupted);

    match engine.run(&invocation, &provider) {
        Ok(outcome) => {
            tracing::info!(%outcome, "command finished");
            Ok(outcome.shell_code())
        }
        Err(CorralError::Interrupted) => {
            tracing::warn!("interrupted, container stopped and cleaned up");
            Ok(INTERRUPTED_EXIT_CODE)
        }
        Err(e) => Err(e)
            .with_context(|| format!("running {} in {}", invocation.command, invocation.image)),
    }
}
