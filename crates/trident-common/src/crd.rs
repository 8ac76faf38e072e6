//! TridentOrchestrator Custom Resource
//!
//! The trident-operator installs Trident when it sees a TridentOrchestrator
//! and reports progress in its status. The installer owns the spec fields
//! below; every other field the operator understands is carried through
//! untouched in `extra`, so updates never drop settings made by others.

use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Install state reported by the trident-operator
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum OrchestratorStatus {
    /// The operator has not reported anything yet
    #[default]
    NoStatus,
    /// Trident is being installed
    Installing,
    /// Trident is installed
    Installed,
    /// Trident is being uninstalled
    Uninstalling,
    /// Trident was uninstalled
    Uninstalled,
    /// Trident and its CRDs were uninstalled
    UninstalledAll,
    /// The last install attempt failed; the operator keeps retrying
    Failed,
    /// Trident is being updated
    Updating,
    /// The operator gave up
    Error,
    /// A state this installer does not know
    Unknown(String),
}

impl OrchestratorStatus {
    /// Status as written by the operator
    pub fn as_str(&self) -> &str {
        match self {
            Self::NoStatus => "",
            Self::Installing => "Installing",
            Self::Installed => "Installed",
            Self::Uninstalling => "Uninstalling",
            Self::Uninstalled => "Uninstalled",
            Self::UninstalledAll => "UninstalledAll",
            Self::Failed => "Failed",
            Self::Updating => "Updating",
            Self::Error => "Error",
            Self::Unknown(s) => s,
        }
    }

    /// Whether a CR in this state is finished and should be cleaned up
    /// before a new one is created
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Uninstalled | Self::UninstalledAll | Self::Failed | Self::Error => true,
            Self::NoStatus
            | Self::Installing
            | Self::Installed
            | Self::Uninstalling
            | Self::Updating
            | Self::Unknown(_) => false,
        }
    }
}

impl From<String> for OrchestratorStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "" => Self::NoStatus,
            "Installing" => Self::Installing,
            "Installed" => Self::Installed,
            "Uninstalling" => Self::Uninstalling,
            "Uninstalled" => Self::Uninstalled,
            "UninstalledAll" => Self::UninstalledAll,
            "Failed" => Self::Failed,
            "Updating" => Self::Updating,
            "Error" => Self::Error,
            _ => Self::Unknown(s),
        }
    }
}

impl From<OrchestratorStatus> for String {
    fn from(status: OrchestratorStatus) -> Self {
        status.as_str().to_string()
    }
}

impl Serialize for OrchestratorStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OrchestratorStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

impl fmt::Display for OrchestratorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoStatus => write!(f, "NoStatus"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Parameters the operator actually installed Trident with
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstallationParams {
    /// Trident image that is running
    #[serde(default)]
    pub trident_image: String,

    /// Remaining parameters, kept as reported
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Status of a TridentOrchestrator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TridentOrchestratorStatus {
    /// Install state
    #[serde(default)]
    #[schemars(with = "String")]
    pub status: OrchestratorStatus,

    /// Human-readable detail for the state
    #[serde(default)]
    pub message: String,

    /// Installed Trident version
    #[serde(default)]
    pub version: String,

    /// Namespace Trident was installed into
    #[serde(default)]
    pub namespace: String,

    /// Parameters of the current installation
    #[serde(default)]
    pub current_installation_params: InstallationParams,
}

/// Specification for a TridentOrchestrator
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trident.netapp.io",
    version = "v1",
    kind = "TridentOrchestrator",
    plural = "tridentorchestrators",
    shortname = "torc",
    status = "TridentOrchestratorStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TridentOrchestratorSpec {
    /// Namespace to install Trident into
    #[serde(default)]
    pub namespace: String,

    /// Enable debug logging
    #[serde(default)]
    pub debug: bool,

    /// Enable the Astra Control Provisioner
    #[serde(default, rename = "enableACP")]
    pub enable_acp: bool,

    /// Astra Control Provisioner image
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub acp_image: String,

    /// Run Trident over IPv6
    #[serde(default, rename = "IPv6")]
    pub ipv6: bool,

    /// Install the Windows node plugin
    #[serde(default)]
    pub windows: bool,

    /// Log format, "text" or "json"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_format: String,

    /// Autosupport image
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub autosupport_image: String,

    /// Proxy used by autosupport
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub autosupport_proxy: String,

    /// Serial number reported by autosupport
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub autosupport_serial_number: String,

    /// Hostname reported by autosupport
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub autosupport_hostname: String,

    /// Trident image to install
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trident_image: String,

    /// Registry to pull Trident's sidecar images from
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_registry: String,

    /// Pull secrets for Trident's images
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,

    /// Ask the operator to uninstall Trident
    #[serde(default)]
    pub uninstall: bool,

    /// What to remove on uninstall
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wipeout: Option<Vec<String>>,

    /// Fields this installer does not manage
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl TridentOrchestrator {
    /// Current install state, `NoStatus` when the operator has not reported
    pub fn install_status(&self) -> OrchestratorStatus {
        self.status
            .as_ref()
            .map(|s| s.status.clone())
            .unwrap_or_default()
    }

    /// Trident image the operator reports as installed
    pub fn installed_image(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|s| s.current_installation_params.trident_image.as_str())
            .filter(|image| !image.is_empty())
    }

    /// Status message reported by the operator
    pub fn status_message(&self) -> &str {
        self.status.as_ref().map(|s| s.message.as_str()).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> TridentOrchestrator {
        let value: serde_json::Value = serde_yaml::from_str(yaml).expect("parse yaml");
        serde_json::from_value(value).expect("parse orchestrator")
    }

    #[test]
    fn status_strings_round_trip_through_the_closed_enum() {
        for s in [
            "",
            "Installing",
            "Installed",
            "Uninstalling",
            "Uninstalled",
            "UninstalledAll",
            "Failed",
            "Updating",
            "Error",
        ] {
            let status = OrchestratorStatus::from(s.to_string());
            assert!(!matches!(status, OrchestratorStatus::Unknown(_)), "{s}");
            assert_eq!(String::from(status), s);
        }

        let odd = OrchestratorStatus::from("Exploding".to_string());
        assert_eq!(odd, OrchestratorStatus::Unknown("Exploding".to_string()));
        assert_eq!(odd.as_str(), "Exploding");
    }

    #[test]
    fn terminal_states_are_the_cleanup_set() {
        let terminal: Vec<_> = [
            OrchestratorStatus::NoStatus,
            OrchestratorStatus::Installing,
            OrchestratorStatus::Installed,
            OrchestratorStatus::Uninstalling,
            OrchestratorStatus::Uninstalled,
            OrchestratorStatus::UninstalledAll,
            OrchestratorStatus::Failed,
            OrchestratorStatus::Updating,
            OrchestratorStatus::Error,
            OrchestratorStatus::Unknown("x".to_string()),
        ]
        .into_iter()
        .filter(OrchestratorStatus::is_terminal)
        .collect();

        assert_eq!(
            terminal,
            vec![
                OrchestratorStatus::Uninstalled,
                OrchestratorStatus::UninstalledAll,
                OrchestratorStatus::Failed,
                OrchestratorStatus::Error,
            ]
        );
    }

    #[test]
    fn parses_operator_written_orchestrator() {
        let torc = parse(
            r#"
apiVersion: trident.netapp.io/v1
kind: TridentOrchestrator
metadata:
  name: trident
spec:
  namespace: trident
  debug: true
  enableACP: true
  IPv6: false
  tridentImage: registry/trident:24.01.0
  imagePullSecrets: [trident-imagepullsecrets]
  kubeletDir: /var/lib/kubelet
status:
  status: Installed
  message: Trident installed
  version: 24.01.0
  currentInstallationParams:
    tridentImage: registry/trident:24.01.0
    logFormat: text
"#,
        );

        assert!(torc.spec.enable_acp);
        assert_eq!(torc.spec.trident_image, "registry/trident:24.01.0");
        assert_eq!(
            torc.spec.extra.get("kubeletDir"),
            Some(&serde_json::json!("/var/lib/kubelet"))
        );
        assert_eq!(torc.install_status(), OrchestratorStatus::Installed);
        assert_eq!(torc.installed_image(), Some("registry/trident:24.01.0"));
        assert_eq!(torc.status_message(), "Trident installed");
    }

    #[test]
    fn unmanaged_fields_survive_serialization() {
        let torc = parse(
            r#"
apiVersion: trident.netapp.io/v1
kind: TridentOrchestrator
metadata:
  name: trident
spec:
  namespace: trident
  kubeletDir: /var/lib/k0s/kubelet
  wipeout: [crds]
"#,
        );

        let value = serde_json::to_value(&torc).unwrap();
        assert_eq!(value["spec"]["kubeletDir"], "/var/lib/k0s/kubelet");
        assert_eq!(value["spec"]["wipeout"], serde_json::json!(["crds"]));
        assert_eq!(value["spec"]["enableACP"], false);
    }

    #[test]
    fn missing_status_reads_as_no_status() {
        let torc = parse(
            r#"
apiVersion: trident.netapp.io/v1
kind: TridentOrchestrator
metadata:
  name: trident
spec: {}
"#,
        );
        assert_eq!(torc.install_status(), OrchestratorStatus::NoStatus);
        assert_eq!(torc.installed_image(), None);
        assert_eq!(torc.install_status().to_string(), "NoStatus");
    }
}
