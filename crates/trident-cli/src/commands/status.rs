//! Status command - show the managed TridentOrchestrator

use std::fmt::Write;
use std::path::PathBuf;

use clap::{Args, ValueEnum};
use kube::ResourceExt;

use trident_common::crd::TridentOrchestrator;
use trident_installer::{InstallTarget, Installer, InstallerOptions};

use super::{connect, load_target};
use crate::Result;

/// Show the TridentOrchestrator managed by the installer
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Path to the InstallTarget YAML file, used to locate the operator
    #[arg(short = 'f', long = "config")]
    pub config_file: Option<PathBuf>,

    /// Path to kubeconfig (defaults to in-cluster config or ~/.kube/config)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Yaml,
    Json,
}

/// Run the status command
pub async fn run(args: StatusArgs) -> Result<()> {
    let target = match &args.config_file {
        Some(path) => load_target(path)?,
        None => InstallTarget::default(),
    };
    let clients = connect(args.kubeconfig.as_deref()).await?;
    let installer = Installer::new(clients, target, InstallerOptions::default()).await?;

    let cr = installer.managed_cr().await?;
    println!("{}", render(&cr, args.output)?);
    Ok(())
}

fn render(cr: &TridentOrchestrator, output: OutputFormat) -> Result<String> {
    Ok(match output {
        OutputFormat::Text => format_status(cr),
        OutputFormat::Yaml => serde_yaml::to_string(cr)?,
        OutputFormat::Json => serde_json::to_string_pretty(cr)?,
    })
}

/// Human readable summary of a TridentOrchestrator
pub fn format_status(cr: &TridentOrchestrator) -> String {
    let status = cr.status.as_ref();
    let or_dash = |value: &str| {
        if value.is_empty() {
            "-".to_string()
        } else {
            value.to_string()
        }
    };

    let mut out = String::new();
    let _ = writeln!(out, "Name:          {}", cr.name_any());
    let _ = writeln!(
        out,
        "Status:        {}",
        or_dash(cr.install_status().as_str())
    );
    let _ = writeln!(
        out,
        "Version:       {}",
        or_dash(status.map(|s| s.version.as_str()).unwrap_or_default())
    );
    let _ = writeln!(out, "Namespace:     {}", or_dash(&cr.spec.namespace));
    let _ = writeln!(out, "Trident image: {}", or_dash(&cr.spec.trident_image));
    let _ = writeln!(
        out,
        "Installed:     {}",
        cr.installed_image().unwrap_or("-")
    );
    let _ = write!(out, "Message:       {}", or_dash(cr.status_message()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use trident_common::crd::{
        InstallationParams, OrchestratorStatus, TridentOrchestratorSpec, TridentOrchestratorStatus,
    };

    fn installed() -> TridentOrchestrator {
        let mut cr = TridentOrchestrator::new(
            "trident",
            TridentOrchestratorSpec {
                namespace: "trident".to_string(),
                trident_image: "registry/trident:24.01.0".to_string(),
                ..Default::default()
            },
        );
        cr.status = Some(TridentOrchestratorStatus {
            status: OrchestratorStatus::Installed,
            message: "Trident installed".to_string(),
            version: "24.01.0".to_string(),
            namespace: "trident".to_string(),
            current_installation_params: InstallationParams {
                trident_image: "registry/trident:24.01.0".to_string(),
                ..Default::default()
            },
        });
        cr
    }

    #[test]
    fn test_format_installed() {
        let text = format_status(&installed());
        assert!(text.contains("Name:          trident"));
        assert!(text.contains("Status:        Installed"));
        assert!(text.contains("Version:       24.01.0"));
        assert!(text.contains("Installed:     registry/trident:24.01.0"));
        assert!(text.ends_with("Message:       Trident installed"));
    }

    #[test]
    fn test_format_without_status() {
        let mut cr = installed();
        cr.status = None;
        let text = format_status(&cr);
        assert!(text.contains("Status:        -"));
        assert!(text.contains("Version:       -"));
        assert!(text.contains("Installed:     -"));
    }

    #[test]
    fn test_render_machine_readable() {
        let cr = installed();

        let yaml = render(&cr, OutputFormat::Yaml).unwrap();
        let parsed: TridentOrchestrator = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.install_status(), OrchestratorStatus::Installed);

        let json = render(&cr, OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["spec"]["tridentImage"], "registry/trident:24.01.0");
        assert_eq!(value["status"]["status"], "Installed");
    }
}
