//! `corral child`: the confined side of `corral run`.
//!
//! Hidden from help. The launcher re-executes the binary with this
//! subcommand inside new namespaces; without the confinement it places in
//! the environment, the subcommand refuses to do anything.

use anyhow::Context;
use clap::Args;

/// Arguments for the hidden `child` command.
#[derive(Args, Debug)]
pub struct ChildArgs {
    /// Image the parent populated the root from.
    pub image: String,

    /// Command to execute inside the root, then its arguments.
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "COMMAND"
    )]
    pub argv: Vec<String>,
}

/// Executes the `child` command.
///
/// # Errors
///
/// Returns an error if the process was not started by `corral run`.
pub fn execute(args: &ChildArgs) -> anyhow::Result<i32> {
    let (command, rest) = args.argv.split_first().context("no command given")?;
    tracing::debug!(image = %args.image, command, "confined child starting");
    corral_runtime::confine::child_main(command, rest)
        .context("the child subcommand is internal to `corral run`")
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::commands::{Cli, Command};

    fn parse(argv: &[&str]) -> ChildArgs {
        match Cli::try_parse_from(argv).expect("parse").command {
            Command::Child(args) => args,
            Command::Run(_) => panic!("expected child"),
        }
    }

    #[test]
    fn launcher_argv_reaches_the_command_intact() {
        let args = parse(&["corral", "child", "--", "busybox", "ls", "-h"]);
        assert_eq!(args.image, "busybox");
        assert_eq!(args.argv, ["ls", "-h"]);
    }

    #[test]
    fn command_flags_are_not_parsed_as_child_flags() {
        let args = parse(&["corral", "child", "--", "img", "sh", "--help", "--version"]);
        assert_eq!(args.argv, ["sh", "--help", "--version"]);
    }
}
