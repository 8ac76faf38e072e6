//! Trident installer CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// trident-install - install Trident through the trident-operator
#[derive(Parser, Debug)]
#[command(name = "trident-install")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install or update Trident and wait for it to come up
    Install(commands::install::InstallArgs),
    /// Show the TridentOrchestrator managed by the installer
    Status(commands::status::StatusArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Install(args) => commands::install::run(args).await,
            Commands::Status(args) => commands::status::run(args).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_install() {
        let cli = Cli::try_parse_from([
            "trident-install",
            "install",
            "-f",
            "target.yaml",
            "--timeout-secs",
            "60",
            "--log-format",
            "json",
        ])
        .unwrap();

        let Commands::Install(args) = cli.command else {
            panic!("expected install");
        };
        assert_eq!(args.config_file.to_str(), Some("target.yaml"));
        assert_eq!(args.timeout_secs, 60);
        assert_eq!(args.log_format, "json");
        assert!(!args.no_debug);
        assert!(args.kubeconfig.is_none());
    }

    #[test]
    fn test_install_requires_target() {
        assert!(Cli::try_parse_from(["trident-install", "install"]).is_err());
    }

    #[test]
    fn test_unknown_log_format_is_rejected() {
        let result = Cli::try_parse_from([
            "trident-install",
            "install",
            "-f",
            "target.yaml",
            "--log-format",
            "xml",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_status_defaults() {
        let cli = Cli::try_parse_from(["trident-install", "status"]).unwrap();
        let Commands::Status(args) = cli.command else {
            panic!("expected status");
        };
        assert!(args.config_file.is_none());
        assert_eq!(args.output, commands::status::OutputFormat::Text);
    }
}
