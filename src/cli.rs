//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// artesync - dependency-aware artefact synchronization
#[derive(Parser, Debug)]
#[command(name = "artesync")]
#[command(version)]
#[command(about = "Reconcile a registry of declared artefacts into persisted state")]
#[command(
    long_about = "artesync discovers artefact definitions in a registry directory, diffs them against persisted state and applies creates, updates and deletes in dependency order."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a single synchronization pass and print its report as JSON
    Run {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Registry directory, overrides `registry_root`
        #[arg(short, long)]
        root: Option<PathBuf>,
    },

    /// Run passes on an interval until interrupted
    Watch {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Registry directory, overrides `registry_root`
        #[arg(short, long)]
        root: Option<PathBuf>,
    },

    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_overrides() {
        let cli = Cli::try_parse_from(["artesync", "run", "--config", "sync.toml", "--root", "reg"]);
        let parsed = cli.ok().map(|c| c.command);
        assert!(matches!(
            parsed,
            Some(Commands::Run { config: Some(_), root: Some(_) })
        ));
    }

    #[test]
    fn test_check_config_requires_path() {
        assert!(Cli::try_parse_from(["artesync", "check-config"]).is_err());
    }
}
