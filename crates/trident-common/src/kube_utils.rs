//! Kubernetes client construction and manifest helpers

use std::path::Path;
use std::time::Duration;

use kube::api::GroupVersionKind;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a by-label lookup searches
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListScope {
    /// A single namespace
    Namespace(String),
    /// Every namespace, or cluster-scoped objects
    AllNamespaces,
}

impl ListScope {
    /// Scope limited to one namespace
    pub fn namespace(ns: impl Into<String>) -> Self {
        Self::Namespace(ns.into())
    }
}

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };

    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    debug!(cluster_url = %config.cluster_url, "Creating kube client");

    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Parsed manifest metadata for creating objects through the dynamic API
#[derive(Debug, Clone)]
pub struct ManifestMetadata {
    /// The parsed JSON value
    pub value: serde_json::Value,
    /// Resource name
    pub name: String,
    /// Namespace, absent for cluster-scoped objects
    pub namespace: Option<String>,
    /// Group, version and kind from `apiVersion` and `kind`
    pub gvk: GroupVersionKind,
}

/// Parse a YAML or JSON manifest and extract its metadata
pub fn parse_manifest(manifest: &str) -> Result<ManifestMetadata, Error> {
    let value: serde_json::Value = serde_yaml::from_str(manifest).map_err(|e| {
        Error::serialization(format!("failed to parse manifest: {}", e))
    })?;

    let api_version = value
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::serialization("manifest missing apiVersion"))?;

    let kind = value
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::serialization("manifest missing kind"))?;

    let name = value
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::serialization_for_kind(kind, "manifest missing metadata.name"))?
        .to_string();

    let namespace = value
        .pointer("/metadata/namespace")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let (group, version) = parse_api_version(api_version);
    let gvk = GroupVersionKind::gvk(&group, &version, kind);

    Ok(ManifestMetadata {
        value,
        name,
        namespace,
        gvk,
    })
}

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use trident_common::kube_utils::parse_api_version;
///
/// let (group, version) = parse_api_version("apps/v1");
/// assert_eq!(group, "apps");
/// assert_eq!(version, "v1");
///
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// assert_eq!(version, "v1");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_namespaced_yaml_manifest() {
        let meta = parse_manifest(
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: trident-operator
  namespace: trident
"#,
        )
        .unwrap();

        assert_eq!(meta.name, "trident-operator");
        assert_eq!(meta.namespace.as_deref(), Some("trident"));
        assert_eq!(meta.gvk.group, "apps");
        assert_eq!(meta.gvk.version, "v1");
        assert_eq!(meta.gvk.kind, "Deployment");
    }

    #[test]
    fn parses_cluster_scoped_json_manifest() {
        let meta = parse_manifest(
            r#"{"apiVersion":"trident.netapp.io/v1","kind":"TridentOrchestrator","metadata":{"name":"trident"}}"#,
        )
        .unwrap();

        assert_eq!(meta.namespace, None);
        assert_eq!(meta.gvk.group, "trident.netapp.io");
        assert_eq!(meta.value["kind"], "TridentOrchestrator");
    }

    #[test]
    fn rejects_incomplete_manifests() {
        assert!(parse_manifest("kind: Secret\nmetadata:\n  name: x\n").is_err());
        assert!(parse_manifest("apiVersion: v1\nmetadata:\n  name: x\n").is_err());
        let err = parse_manifest("apiVersion: v1\nkind: Secret\nmetadata: {}\n").unwrap_err();
        assert!(matches!(
            err,
            Error::Serialization { kind: Some(ref k), .. } if k == "Secret"
        ));
    }

    #[test]
    fn core_group_has_empty_group() {
        assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
        assert_eq!(
            parse_api_version("rbac.authorization.k8s.io/v1"),
            ("rbac.authorization.k8s.io".to_string(), "v1".to_string())
        );
    }
}
