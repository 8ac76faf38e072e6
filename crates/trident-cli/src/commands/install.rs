//! Install command - install or update Trident on a cluster
//!
//! Loads the install target, connects to the cluster and runs the installer
//! until Trident is up, then prints the managed TridentOrchestrator.
//! Ctrl-C cancels the run.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use trident_installer::{Installer, InstallerOptions};

use super::{connect, load_target, status};
use crate::{Error, Result};

/// Install or update Trident
#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Path to the InstallTarget YAML file
    #[arg(short = 'f', long = "config")]
    pub config_file: PathBuf,

    /// Path to kubeconfig (defaults to in-cluster config or ~/.kube/config)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Path to registry credentials file (dockerconfigjson format), used
    /// when the target carries no image pull secret
    #[arg(long, env = "REGISTRY_CREDENTIALS_FILE")]
    pub registry_credentials_file: Option<PathBuf>,

    /// Timeout for the entire installation in seconds
    #[arg(long, default_value = "300")]
    pub timeout_secs: u64,

    /// Log format for the operator and Trident
    #[arg(long, default_value = "text", value_parser = ["text", "json"])]
    pub log_format: String,

    /// Run the operator and Trident without debug logging
    #[arg(long)]
    pub no_debug: bool,
}

/// Build installer options from the command line
pub fn installer_options(args: &InstallArgs) -> Result<InstallerOptions> {
    if args.timeout_secs == 0 {
        return Err(Error::validation("--timeout-secs must be greater than zero"));
    }

    let registry_credentials = match &args.registry_credentials_file {
        Some(path) => Some(std::fs::read(path)?),
        None => None,
    };

    Ok(InstallerOptions {
        log_format: args.log_format.clone(),
        debug: !args.no_debug,
        registry_credentials,
        ..InstallerOptions::with_timeout(Duration::from_secs(args.timeout_secs))
    })
}

/// Run the install command
pub async fn run(args: InstallArgs) -> Result<()> {
    let target = load_target(&args.config_file)?;
    let options = installer_options(&args)?;
    let clients = connect(args.kubeconfig.as_deref()).await?;

    let installer = Installer::new(clients, target, options).await?;
    info!(
        namespace = installer.namespace(),
        operator_version = %installer.expected_operator_version(),
        "Installing Trident"
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling installation");
            interrupt.cancel();
        }
    });

    installer.run(&cancel).await?;

    let cr = installer.managed_cr().await?;
    println!("{}", status::format_status(&cr));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> InstallArgs {
        InstallArgs {
            config_file: PathBuf::from("target.yaml"),
            kubeconfig: None,
            registry_credentials_file: None,
            timeout_secs: 120,
            log_format: "json".to_string(),
            no_debug: true,
        }
    }

    #[test]
    fn test_installer_options_from_args() {
        let options = installer_options(&args()).unwrap();
        assert_eq!(options.timeout, Duration::from_secs(120));
        assert_eq!(options.run_backoff.max_elapsed, Duration::from_secs(120));
        assert_eq!(options.poll_backoff.max_elapsed, Duration::from_secs(120));
        assert_eq!(options.log_format, "json");
        assert!(!options.debug);
        assert!(options.registry_credentials.is_none());
    }

    #[test]
    fn test_registry_credentials_are_read_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, br#"{"auths":{"registry":{}}}"#).unwrap();

        let options = installer_options(&InstallArgs {
            registry_credentials_file: Some(path),
            ..args()
        })
        .unwrap();
        assert_eq!(
            options.registry_credentials.as_deref(),
            Some(&br#"{"auths":{"registry":{}}}"#[..])
        );
    }

    #[test]
    fn test_missing_registry_credentials_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = installer_options(&InstallArgs {
            registry_credentials_file: Some(dir.path().join("absent.json")),
            ..args()
        });
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let result = installer_options(&InstallArgs {
            timeout_secs: 0,
            ..args()
        });
        assert!(matches!(result, Err(Error::Validation { .. })));
    }
}
