//! # corral
//!
//! Runs one command inside an image: fresh PID, mount, and UTS namespaces,
//! a pid-limited cgroup, and a chroot into a throwaway root directory.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

mod commands;

use clap::Parser;

use crate::commands::Cli;

fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout belongs to the confined command.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = commands::execute(cli)?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
