//! CLI module for Cadence
//!
//! Provides commands:
//! - `run`: start the scheduler from configuration
//! - `check`: validate configuration and print a summary

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod check;
pub mod run;

/// Cadence scheduler CLI
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(about = "In-process job scheduler")]
#[command(version)]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run declared triggers and jobs until Ctrl-C or until every trigger stops
    Run {
        /// Configuration file layered over the defaults
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Validate configuration and print a summary
    Check {
        /// Configuration file layered over the defaults
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// Run the CLI command
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Some(Commands::Run { config }) => run::run(config.as_deref()).await,
        Some(Commands::Check { config }) => check::run(config.as_deref()),
        None => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            cmd.print_help()?;
            println!();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_config() {
        let cli = Cli::try_parse_from(["cadence", "run", "--config", "jobs.toml", "--json"]).unwrap();
        assert!(cli.json);
        match cli.command {
            Some(Commands::Run { config }) => {
                assert_eq!(config, Some(PathBuf::from("jobs.toml")));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_check_without_config() {
        let cli = Cli::try_parse_from(["cadence", "check"]).unwrap();
        assert!(!cli.json);
        assert!(matches!(cli.command, Some(Commands::Check { config: None })));
    }

    #[test]
    fn test_command_definition_is_consistent() {
        <Cli as clap::CommandFactory>::command().debug_assert();
    }
}
