//! CLI command definitions and dispatch.

pub mod child;
pub mod run;

use clap::{Parser, Subcommand};

/// Corral: run a command confined to an image.
#[derive(Parser, Debug)]
#[command(name = "corral", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a command inside an image.
    Run(run::RunArgs),
    /// Internal re-exec entry point of a confined child.
    #[command(hide = true)]
    Child(child::ChildArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// Returns the exit code the process should end with.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Command::Run(args) => run::execute(args),
        Command::Child(args) => child::execute(&args),
    }
}
