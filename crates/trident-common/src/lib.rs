//! Common types for the Trident installer: errors, backoff, versions, patching and discovery

#![deny(missing_docs)]

pub mod crd;
pub mod discovery;
pub mod error;
pub mod kube_utils;
pub mod patch;
pub mod retry;
pub mod version;

use std::time::Duration;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Overall time budget for one installation run and for each wait inside it
pub const K8S_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Oldest trident-operator release this installer can drive
pub const OPERATOR_MIN_VERSION: &str = "21.01.0";

/// Namespace used when no operator is installed yet
pub const OPERATOR_NAMESPACE: &str = "trident";

/// Name shared by the operator's service account, cluster role, binding, deployment and container
pub const OPERATOR_NAME: &str = "trident-operator";

/// Label key applied to every operator object
pub const OPERATOR_LABEL_KEY: &str = "app";

/// Label value applied to every operator object
pub const OPERATOR_LABEL_VALUE: &str = "operator.trident.netapp.io";

/// Label selector for operator objects (for Kubernetes API queries)
pub const OPERATOR_LABEL: &str = "app=operator.trident.netapp.io";

/// Canonical name of the operator's image pull secret
pub const IMAGE_PULL_SECRET_NAME: &str = "trident-imagepullsecrets";

/// Label selector for the Trident controller pod created by the operator
pub const TRIDENT_CONTROLLER_LABEL: &str = "app=controller.csi.trident.netapp.io";

/// Main container of the Trident controller pod
pub const TRIDENT_CONTROLLER_CONTAINER: &str = "trident-main";

/// Name of the TridentOrchestrator CRD
pub const ORCHESTRATOR_CRD_NAME: &str = "tridentorchestrators.trident.netapp.io";

/// Name of the TridentOrchestrator created by the installer
pub const ORCHESTRATOR_CR_NAME: &str = "trident";

/// Field manager recorded on objects written by the installer
pub const FIELD_MANAGER: &str = "trident-installer";
