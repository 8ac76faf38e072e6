//! Manifests for every object the installer creates
//!
//! Objects are built as typed k8s-openapi values and serialized, so names,
//! labels and images can never collide with template syntax. Kinds without
//! a typed model (VolumeSnapshotClass) are built as JSON values.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, LocalObjectReference, Namespace, ObjectFieldSelector,
    PodSpec, PodTemplateSpec, Secret, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
    CustomResourceDefinitionVersion, CustomResourceSubresourceStatus,
    CustomResourceSubresources, CustomResourceValidation, JSONSchemaProps,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::ByteString;
use serde::Serialize;
use serde_json::{json, Value};

use trident_common::crd::{TridentOrchestrator, TridentOrchestratorSpec};
use trident_common::discovery::ClusterFlavor;
use trident_common::{
    Error, IMAGE_PULL_SECRET_NAME, OPERATOR_LABEL_KEY, OPERATOR_LABEL_VALUE, OPERATOR_NAME,
    ORCHESTRATOR_CRD_NAME, ORCHESTRATOR_CR_NAME,
};

/// CSI driver name registered by Trident
pub const CSI_DRIVER: &str = "csi.trident.netapp.io";

/// Annotation marking the cluster's default storage class
pub const DEFAULT_STORAGE_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";

const OPENSHIFT_RBAC_API_VERSION: &str = "authorization.openshift.io/v1";

/// Serialize a manifest to YAML
pub fn to_yaml<T: Serialize>(kind: &str, object: &T) -> Result<String, Error> {
    serde_yaml::to_string(object)
        .map_err(|e| Error::serialization_for_kind(kind, format!("failed to render manifest: {e}")))
}

fn operator_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(
        OPERATOR_LABEL_KEY.to_string(),
        OPERATOR_LABEL_VALUE.to_string(),
    )])
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Namespace the operator runs in
pub fn namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Service account the operator runs as
pub fn service_account(namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(OPERATOR_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(operator_labels()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn rule(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(strings(api_groups)),
        resources: Some(strings(resources)),
        verbs: strings(verbs),
        ..Default::default()
    }
}

fn named_rule(
    api_groups: &[&str],
    resources: &[&str],
    verbs: &[&str],
    resource_names: &[&str],
) -> PolicyRule {
    PolicyRule {
        resource_names: Some(strings(resource_names)),
        ..rule(api_groups, resources, verbs)
    }
}

const ALL_VERBS: &[&str] = &["get", "list", "watch", "create", "delete", "update", "patch"];
const READ_VERBS: &[&str] = &["get", "list", "watch"];
const MUTATE_VERBS: &[&str] = &["delete", "update", "patch"];
const STATUS_VERBS: &[&str] = &["update", "patch"];

const TRIDENT_RESOURCES: &[&str] = &[
    "tridentversions",
    "tridentbackends",
    "tridentstorageclasses",
    "tridentvolumes",
    "tridentvolumepublications",
    "tridentvolumereferences",
    "tridentnodes",
    "tridenttransactions",
    "tridentsnapshots",
    "tridentbackendconfigs",
    "tridentbackendconfigs/status",
    "tridentmirrorrelationships",
    "tridentmirrorrelationships/status",
    "tridentactionmirrorupdates",
    "tridentactionmirrorupdates/status",
    "tridentsnapshotinfos",
    "tridentsnapshotinfos/status",
    "tridentactionsnapshotrestores",
    "tridentactionsnapshotrestores/status",
    "tridentprovisioners",
    "tridentprovisioners/status",
    "tridentorchestrators",
    "tridentorchestrators/status",
];

const TRIDENT_WORKLOADS: &[&str] = &["trident", "trident-csi", "trident-controller"];
const TRIDENT_NODE_WORKLOADS: &[&str] = &[
    "trident",
    "trident-csi",
    "trident-csi-windows",
    "trident-node-linux",
    "trident-node-windows",
];
const TRIDENT_ACCOUNTS: &[&str] = &[
    "trident-controller",
    "trident-node-linux",
    "trident-node-windows",
    "trident-csi",
    "trident",
];
const TRIDENT_SCCS: &[&str] = &[
    "trident-controller",
    "trident-node-linux",
    "trident-node-windows",
    "trident",
];
const RBAC_GROUPS: &[&str] = &["authorization.openshift.io", "rbac.authorization.k8s.io"];
const RBAC_RESOURCES: &[&str] = &["roles", "rolebindings", "clusterroles", "clusterrolebindings"];

fn operator_rules() -> Vec<PolicyRule> {
    vec![
        // Trident's own permissions, granted so the operator can hand them out
        rule(&[""], &["namespaces"], &["get", "list"]),
        rule(&[""], &["persistentvolumes", "persistentvolumeclaims"], ALL_VERBS),
        rule(&[""], &["persistentvolumeclaims/status"], STATUS_VERBS),
        rule(&["storage.k8s.io"], &["storageclasses"], ALL_VERBS),
        rule(
            &[""],
            &["events"],
            &["get", "list", "watch", "create", "update", "patch"],
        ),
        rule(&[""], &["secrets"], ALL_VERBS),
        rule(&[""], &["resourcequotas"], ALL_VERBS),
        rule(&[""], &["pods"], ALL_VERBS),
        rule(&[""], &["pods/log"], READ_VERBS),
        rule(&[""], &["nodes"], &["get", "list", "watch", "update"]),
        rule(
            &["storage.k8s.io"],
            &["volumeattachments"],
            &["get", "list", "watch", "update", "patch"],
        ),
        rule(&["storage.k8s.io"], &["volumeattachments/status"], STATUS_VERBS),
        rule(
            &["snapshot.storage.k8s.io"],
            &["volumesnapshots", "volumesnapshotclasses"],
            &["get", "list", "watch", "update", "patch"],
        ),
        rule(
            &["snapshot.storage.k8s.io"],
            &["volumesnapshots/status", "volumesnapshotcontents/status"],
            STATUS_VERBS,
        ),
        rule(&["snapshot.storage.k8s.io"], &["volumesnapshotcontents"], ALL_VERBS),
        rule(&["csi.storage.k8s.io"], &["csidrivers", "csinodeinfos"], ALL_VERBS),
        rule(&["storage.k8s.io"], &["csidrivers", "csinodes"], ALL_VERBS),
        rule(
            &["apiextensions.k8s.io"],
            &["customresourcedefinitions"],
            ALL_VERBS,
        ),
        rule(&["trident.netapp.io"], TRIDENT_RESOURCES, ALL_VERBS),
        named_rule(&["policy"], &["podsecuritypolicies"], &["use"], &["tridentpods"]),
        // Operator specific
        rule(&[""], &["namespaces"], &["create", "patch"]),
        rule(
            &["apps"],
            &["deployments", "daemonsets", "statefulsets"],
            &["get", "list", "watch", "create"],
        ),
        named_rule(
            &["apps"],
            &["deployments", "statefulsets"],
            MUTATE_VERBS,
            TRIDENT_WORKLOADS,
        ),
        named_rule(&["apps"], &["daemonsets"], MUTATE_VERBS, TRIDENT_NODE_WORKLOADS),
        rule(
            &[""],
            &["pods/exec", "services", "serviceaccounts"],
            &["get", "list", "create"],
        ),
        named_rule(
            &[""],
            &["pods/exec", "services"],
            MUTATE_VERBS,
            &["trident-csi", "trident"],
        ),
        named_rule(&[""], &["serviceaccounts"], MUTATE_VERBS, TRIDENT_ACCOUNTS),
        rule(RBAC_GROUPS, RBAC_RESOURCES, &["list", "create"]),
        named_rule(RBAC_GROUPS, RBAC_RESOURCES, MUTATE_VERBS, TRIDENT_ACCOUNTS),
        rule(&["policy"], &["podsecuritypolicies"], &["list", "create"]),
        named_rule(
            &["policy"],
            &["podsecuritypolicies"],
            MUTATE_VERBS,
            &["tridentpods"],
        ),
        rule(
            &["security.openshift.io"],
            &["securitycontextconstraints"],
            &["get", "list", "create"],
        ),
        named_rule(
            &["security.openshift.io"],
            &["securitycontextconstraints"],
            MUTATE_VERBS,
            TRIDENT_SCCS,
        ),
        named_rule(
            &["policy"],
            &["podsecuritypolicies"],
            &["use"],
            &[
                "trident-controller",
                "trident-node-linux",
                "trident-node-windows",
                "tridentoperatorpods",
            ],
        ),
    ]
}

/// Cluster role granting the operator everything it needs to install Trident
pub fn cluster_role() -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(OPERATOR_NAME.to_string()),
            labels: Some(operator_labels()),
            ..Default::default()
        },
        rules: Some(operator_rules()),
        ..Default::default()
    }
}

/// Binding of the operator's cluster role to its service account
pub fn cluster_role_binding(namespace: &str) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(OPERATOR_NAME.to_string()),
            labels: Some(operator_labels()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: OPERATOR_NAME.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: OPERATOR_NAME.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

/// Render the cluster role for the given cluster flavor.
///
/// OpenShift gets the role through its own authorization API group.
pub fn cluster_role_manifest(flavor: ClusterFlavor) -> Result<String, Error> {
    let mut value = to_value("ClusterRole", &cluster_role())?;
    if flavor == ClusterFlavor::OpenShift {
        value["apiVersion"] = json!(OPENSHIFT_RBAC_API_VERSION);
    }
    to_yaml("ClusterRole", &value)
}

/// Render the cluster role binding for the given cluster flavor.
///
/// The OpenShift authorization API does not take an `apiGroup` in the
/// role reference.
pub fn cluster_role_binding_manifest(
    flavor: ClusterFlavor,
    namespace: &str,
) -> Result<String, Error> {
    let mut value = to_value("ClusterRoleBinding", &cluster_role_binding(namespace))?;
    if flavor == ClusterFlavor::OpenShift {
        value["apiVersion"] = json!(OPENSHIFT_RBAC_API_VERSION);
        if let Some(role_ref) = value.get_mut("roleRef").and_then(Value::as_object_mut) {
            role_ref.remove("apiGroup");
        }
    }
    to_yaml("ClusterRoleBinding", &value)
}

fn to_value<T: Serialize>(kind: &str, object: &T) -> Result<Value, Error> {
    serde_json::to_value(object)
        .map_err(|e| Error::serialization_for_kind(kind, format!("failed to render manifest: {e}")))
}

/// Image pull secret referenced by the operator deployment and the CR
pub fn image_pull_secret(namespace: &str, docker_config: &[u8]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(IMAGE_PULL_SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(operator_labels()),
            ..Default::default()
        },
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        data: Some(BTreeMap::from([(
            ".dockerconfigjson".to_string(),
            ByteString(docker_config.to_vec()),
        )])),
        ..Default::default()
    }
}

/// trident-operator deployment
pub fn operator_deployment(namespace: &str, image: &str, log_format: &str, debug: bool) -> Deployment {
    let mut pod_labels = operator_labels();
    pod_labels.insert("name".to_string(), OPERATOR_NAME.to_string());

    let mut args = vec![format!("--log-format={log_format}")];
    if debug {
        args.push("--debug".to_string());
    }

    Deployment {
        metadata: ObjectMeta {
            name: Some(OPERATOR_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(operator_labels()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(pod_labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(OPERATOR_NAME.to_string()),
                    containers: vec![Container {
                        name: OPERATOR_NAME.to_string(),
                        image: Some(image.to_string()),
                        command: Some(vec!["/trident-operator".to_string()]),
                        args: Some(args),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        env: Some(vec![
                            EnvVar {
                                name: "POD_NAME".to_string(),
                                value_from: Some(EnvVarSource {
                                    field_ref: Some(ObjectFieldSelector {
                                        field_path: "metadata.name".to_string(),
                                        ..Default::default()
                                    }),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                            EnvVar {
                                name: "OPERATOR_NAME".to_string(),
                                value: Some(OPERATOR_NAME.to_string()),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    image_pull_secrets: Some(vec![LocalObjectReference {
                        name: IMAGE_PULL_SECRET_NAME.to_string(),
                    }]),
                    node_selector: Some(BTreeMap::from([
                        ("kubernetes.io/os".to_string(), "linux".to_string()),
                        ("kubernetes.io/arch".to_string(), "amd64".to_string()),
                    ])),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// TridentOrchestrator CRD.
///
/// The schema preserves unknown fields: the operator, not this installer,
/// owns validation of the spec.
pub fn orchestrator_crd() -> CustomResourceDefinition {
    CustomResourceDefinition {
        metadata: ObjectMeta {
            name: Some(ORCHESTRATOR_CRD_NAME.to_string()),
            ..Default::default()
        },
        spec: CustomResourceDefinitionSpec {
            group: "trident.netapp.io".to_string(),
            names: CustomResourceDefinitionNames {
                kind: "TridentOrchestrator".to_string(),
                list_kind: Some("TridentOrchestratorList".to_string()),
                plural: "tridentorchestrators".to_string(),
                singular: Some("tridentorchestrator".to_string()),
                short_names: Some(strings(&["torc", "torchestrator"])),
                ..Default::default()
            },
            scope: "Cluster".to_string(),
            versions: vec![CustomResourceDefinitionVersion {
                name: "v1".to_string(),
                served: true,
                storage: true,
                schema: Some(CustomResourceValidation {
                    open_api_v3_schema: Some(JSONSchemaProps {
                        type_: Some("object".to_string()),
                        x_kubernetes_preserve_unknown_fields: Some(true),
                        ..Default::default()
                    }),
                }),
                subresources: Some(CustomResourceSubresources {
                    status: Some(CustomResourceSubresourceStatus(json!({}))),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Settings the installer owns on the TridentOrchestrator
#[derive(Clone, Debug, PartialEq)]
pub struct OrchestratorSettings {
    /// Namespace Trident is installed into
    pub namespace: String,
    /// Enable debug logging
    pub debug: bool,
    /// Log format, "text" or "json"
    pub log_format: String,
    /// Trident image
    pub trident_image: String,
    /// Autosupport image
    pub autosupport_image: String,
    /// Astra Control Provisioner image
    pub acp_image: String,
    /// Proxy for autosupport
    pub proxy_url: String,
    /// Serial number reported by autosupport
    pub serial_number: String,
    /// Hostname reported by autosupport
    pub hostname: String,
}

impl OrchestratorSettings {
    /// Copy the managed fields into an existing spec, leaving others alone.
    ///
    /// Uninstall flags are cleared so a CR left mid-uninstall is driven
    /// back to an install.
    pub fn apply_to(&self, spec: &mut TridentOrchestratorSpec) {
        spec.debug = self.debug;
        spec.enable_acp = true;
        spec.acp_image = self.acp_image.clone();
        spec.autosupport_image = self.autosupport_image.clone();
        spec.autosupport_proxy = self.proxy_url.clone();
        spec.autosupport_serial_number = self.serial_number.clone();
        spec.autosupport_hostname = self.hostname.clone();
        spec.trident_image = self.trident_image.clone();
        spec.image_pull_secrets = vec![IMAGE_PULL_SECRET_NAME.to_string()];
        spec.uninstall = false;
        spec.wipeout = None;
    }
}

/// TridentOrchestrator named `trident` asking the operator to install
pub fn orchestrator_cr(settings: &OrchestratorSettings) -> TridentOrchestrator {
    let mut spec = TridentOrchestratorSpec {
        namespace: settings.namespace.clone(),
        log_format: settings.log_format.clone(),
        ..Default::default()
    };
    settings.apply_to(&mut spec);
    TridentOrchestrator::new(ORCHESTRATOR_CR_NAME, spec)
}

/// Backing of a CVS storage class
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CvsStorageClass {
    /// Performance pools with immediate binding
    Hardware,
    /// Software pools, bound once a consumer is scheduled
    Software,
}

impl CvsStorageClass {
    /// Value used in pool labels and selectors
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hardware => "hardware",
            Self::Software => "software",
        }
    }

    fn volume_binding_mode(&self) -> &'static str {
        match self {
            Self::Hardware => "Immediate",
            Self::Software => "WaitForFirstConsumer",
        }
    }
}

/// Storage class selecting Trident GCP pools by service level
pub fn gcp_storage_class(
    name: &str,
    service_level: &str,
    class: CvsStorageClass,
    is_default: bool,
) -> StorageClass {
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            annotations: Some(BTreeMap::from([(
                DEFAULT_STORAGE_CLASS_ANNOTATION.to_string(),
                is_default.to_string(),
            )])),
            ..Default::default()
        },
        provisioner: CSI_DRIVER.to_string(),
        parameters: Some(BTreeMap::from([
            ("backendType".to_string(), "gcp-cvs".to_string()),
            (
                "selector".to_string(),
                format!("serviceLevel={service_level};storageClass={}", class.as_str()),
            ),
        ])),
        volume_binding_mode: Some(class.volume_binding_mode().to_string()),
        allow_volume_expansion: Some(true),
        ..Default::default()
    }
}

/// VolumeSnapshotClass for Trident volumes
pub fn volume_snapshot_class(name: &str) -> Value {
    json!({
        "apiVersion": "snapshot.storage.k8s.io/v1",
        "kind": "VolumeSnapshotClass",
        "metadata": { "name": name },
        "driver": CSI_DRIVER,
        "deletionPolicy": "Delete",
    })
}
