//! Cluster capabilities the installer depends on
//!
//! Each resource family gets its own narrow trait so the installer, and its
//! tests, only deal with the calls a phase actually makes. One
//! [`KubeClusterClient`] implements all of them against a live API server;
//! [`ClusterClients`] bundles them as trait objects.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionCondition,
};
use kube::api::{
    Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams, PostParams,
};
use kube::{Client, ResourceExt};
use serde_json::Value;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use trident_common::crd::TridentOrchestrator;
use trident_common::discovery::{ClusterFlavor, DynamicResourceResolver};
use trident_common::kube_utils::{parse_manifest, ListScope};
use trident_common::{Error, FIELD_MANAGER};

/// Kinds the installer reaches through the dynamic API
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    /// core/v1 ServiceAccount
    ServiceAccount,
    /// core/v1 Secret
    Secret,
    /// rbac ClusterRole
    ClusterRole,
    /// rbac ClusterRoleBinding
    ClusterRoleBinding,
    /// snapshot.storage.k8s.io VolumeSnapshotClass
    VolumeSnapshotClass,
}

impl ObjectKind {
    /// Group, version and kind used to resolve the API resource
    pub fn gvk(&self) -> GroupVersionKind {
        match self {
            Self::ServiceAccount => GroupVersionKind::gvk("", "v1", "ServiceAccount"),
            Self::Secret => GroupVersionKind::gvk("", "v1", "Secret"),
            Self::ClusterRole => {
                GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "ClusterRole")
            }
            Self::ClusterRoleBinding => {
                GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding")
            }
            Self::VolumeSnapshotClass => {
                GroupVersionKind::gvk("snapshot.storage.k8s.io", "v1", "VolumeSnapshotClass")
            }
        }
    }

    /// Lower-case name used in logs and errors
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceAccount => "service account",
            Self::Secret => "secret",
            Self::ClusterRole => "cluster role",
            Self::ClusterRoleBinding => "cluster role binding",
            Self::VolumeSnapshotClass => "volume snapshot class",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pod lifecycle phase, used to filter pod lookups
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodPhase {
    /// Accepted, containers not all started
    Pending,
    /// Bound to a node with at least one container running
    Running,
    /// All containers exited successfully
    Succeeded,
    /// All containers exited, at least one failed
    Failed,
}

impl PodPhase {
    /// Phase as reported in `status.phase`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        }
    }
}

/// Return the only item, NotFound for none and Ambiguous for several
pub fn exactly_one<T>(kind: &str, label: &str, mut items: Vec<T>) -> Result<T, Error> {
    match items.len() {
        0 => Err(Error::not_found(
            kind,
            format!("no {kind} has the label {label}"),
        )),
        1 => Ok(items.remove(0)),
        n => Err(Error::ambiguous(
            kind,
            format!("{n} objects of kind {kind} have the label {label}"),
        )),
    }
}

/// Namespace checks
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NamespaceClient: Send + Sync {
    /// Check whether a namespace exists
    async fn namespace_exists(&self, name: &str) -> Result<bool, Error>;
}

/// Untyped object access through the dynamic resource resolver
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Create the object described by a YAML or JSON manifest
    async fn create_object(&self, manifest: &str) -> Result<(), Error>;

    /// List objects of a kind carrying a label
    async fn list_by_label(
        &self,
        kind: ObjectKind,
        label: &str,
        scope: &ListScope,
    ) -> Result<Vec<DynamicObject>, Error>;

    /// Get the single object of a kind carrying a label
    async fn get_by_label(
        &self,
        kind: ObjectKind,
        label: &str,
        scope: &ListScope,
    ) -> Result<DynamicObject, Error>;

    /// Apply a merge patch to the single object of a kind carrying a label
    async fn patch_by_label(
        &self,
        kind: ObjectKind,
        label: &str,
        scope: &ListScope,
        patch: &[u8],
    ) -> Result<(), Error>;

    /// Delete every object of a kind carrying a label
    async fn delete_by_label(
        &self,
        kind: ObjectKind,
        label: &str,
        scope: &ListScope,
    ) -> Result<(), Error>;

    /// Delete one object by name; an absent object is not an error
    async fn delete_by_name(
        &self,
        kind: ObjectKind,
        name: &str,
        namespace: Option<String>,
    ) -> Result<(), Error>;
}

/// Deployment access
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentClient: Send + Sync {
    /// List deployments carrying a label
    async fn list_deployments(
        &self,
        label: &str,
        scope: &ListScope,
    ) -> Result<Vec<Deployment>, Error>;

    /// Apply a merge patch to a deployment
    async fn patch_deployment(&self, name: &str, namespace: &str, patch: &[u8])
        -> Result<(), Error>;

    /// Delete a deployment; an absent deployment is not an error
    async fn delete_deployment(&self, name: &str, namespace: &str) -> Result<(), Error>;
}

/// Pod lookups
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodClient: Send + Sync {
    /// Get the single pod carrying a label, optionally in a given phase
    async fn get_pod_by_label(
        &self,
        label: &str,
        scope: &ListScope,
        phase: Option<PodPhase>,
    ) -> Result<Pod, Error>;
}

/// Commands run inside pods
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodExec: Send + Sync {
    /// Run a command in a pod container and return stdout followed by stderr.
    ///
    /// The container may be omitted for single-container pods.
    async fn exec(
        &self,
        pod: &str,
        container: Option<String>,
        namespace: &str,
        command: &[String],
    ) -> Result<Vec<u8>, Error>;
}

/// CustomResourceDefinition access
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CrdClient: Send + Sync {
    /// Check whether a CRD exists
    async fn crd_exists(&self, name: &str) -> Result<bool, Error>;

    /// Status conditions of a CRD
    async fn get_crd_conditions(
        &self,
        name: &str,
    ) -> Result<Vec<CustomResourceDefinitionCondition>, Error>;

    /// Delete a CRD; an absent CRD is not an error
    async fn delete_crd(&self, name: &str) -> Result<(), Error>;
}

/// TridentOrchestrator access
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    /// List every TridentOrchestrator
    async fn list_orchestrators(&self) -> Result<Vec<TridentOrchestrator>, Error>;

    /// Replace a TridentOrchestrator
    async fn update_orchestrator(
        &self,
        orchestrator: &TridentOrchestrator,
    ) -> Result<TridentOrchestrator, Error>;

    /// Delete a TridentOrchestrator; an absent one is not an error
    async fn delete_orchestrator(&self, name: &str) -> Result<(), Error>;
}

/// Storage class and volume snapshot class access
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Get a storage class by name, NotFound when absent
    async fn get_storage_class(&self, name: &str) -> Result<StorageClass, Error>;

    /// List every storage class
    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>, Error>;

    /// Apply a merge patch to a storage class
    async fn patch_storage_class(&self, name: &str, patch: &[u8]) -> Result<(), Error>;

    /// Delete a storage class; an absent one is not an error
    async fn delete_storage_class(&self, name: &str) -> Result<(), Error>;

    /// Get a volume snapshot class by name, NotFound when absent
    async fn get_volume_snapshot_class(&self, name: &str) -> Result<DynamicObject, Error>;

    /// Apply a merge patch to a volume snapshot class
    async fn patch_volume_snapshot_class(&self, name: &str, patch: &[u8]) -> Result<(), Error>;
}

/// Every cluster capability the installer uses
#[derive(Clone)]
pub struct ClusterClients {
    /// Namespace checks
    pub namespaces: Arc<dyn NamespaceClient>,
    /// Dynamic object access
    pub objects: Arc<dyn ObjectClient>,
    /// Deployments
    pub deployments: Arc<dyn DeploymentClient>,
    /// Pods
    pub pods: Arc<dyn PodClient>,
    /// Pod exec
    pub exec: Arc<dyn PodExec>,
    /// CRDs
    pub crds: Arc<dyn CrdClient>,
    /// TridentOrchestrators
    pub orchestrators: Arc<dyn OrchestratorClient>,
    /// Storage classes and snapshot classes
    pub storage: Arc<dyn StorageClient>,
    /// Kubernetes or OpenShift
    pub flavor: ClusterFlavor,
}

impl ClusterClients {
    /// Wire one kube client into every capability.
    ///
    /// The flavor is taken from what the resolver has discovered so far.
    pub fn from_kube(client: Client, resolver: Arc<DynamicResourceResolver>) -> Self {
        let flavor = resolver.flavor();
        let kube = Arc::new(KubeClusterClient::new(client, resolver));
        Self {
            namespaces: kube.clone(),
            objects: kube.clone(),
            deployments: kube.clone(),
            pods: kube.clone(),
            exec: kube.clone(),
            crds: kube.clone(),
            orchestrators: kube.clone(),
            storage: kube,
            flavor,
        }
    }

    /// Discover the cluster's API and wire a kube client into every capability
    pub async fn connect(client: Client) -> Self {
        let resolver = Arc::new(DynamicResourceResolver::from_client(client.clone()));
        resolver.warm().await;
        let clients = Self::from_kube(client, resolver);
        info!(flavor = ?clients.flavor, "Connected to cluster");
        clients
    }
}

/// Cluster access through kube-rs
pub struct KubeClusterClient {
    pub(crate) client: Client,
    resolver: Arc<DynamicResourceResolver>,
    field_manager: String,
}

impl KubeClusterClient {
    /// Create a client resolving dynamic kinds through `resolver`
    pub fn new(client: Client, resolver: Arc<DynamicResourceResolver>) -> Self {
        Self {
            client,
            resolver,
            field_manager: FIELD_MANAGER.to_string(),
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }

    async fn dynamic_api(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>, Error> {
        let resolved = self.resolver.resolve(gvk).await?;
        Ok(match namespace {
            Some(ns) if resolved.namespaced => {
                Api::namespaced_with(self.client.clone(), ns, &resolved.api_resource)
            }
            _ => Api::all_with(self.client.clone(), &resolved.api_resource),
        })
    }

    async fn scoped_api(
        &self,
        kind: ObjectKind,
        scope: &ListScope,
    ) -> Result<Api<DynamicObject>, Error> {
        let namespace = match scope {
            ListScope::Namespace(ns) => Some(ns.as_str()),
            ListScope::AllNamespaces => None,
        };
        self.dynamic_api(&kind.gvk(), namespace).await
    }
}

fn merge_patch_value(patch: &[u8]) -> Result<Value, Error> {
    serde_json::from_slice(patch)
        .map_err(|e| Error::serialization(format!("invalid merge patch: {e}")))
}

fn ignore_not_found(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

fn label_params(label: &str) -> ListParams {
    ListParams::default().labels(label)
}

#[async_trait]
impl NamespaceClient for KubeClusterClient {
    async fn namespace_exists(&self, name: &str) -> Result<bool, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }
}

#[async_trait]
impl ObjectClient for KubeClusterClient {
    async fn create_object(&self, manifest: &str) -> Result<(), Error> {
        let meta = parse_manifest(manifest)?;
        let api = self
            .dynamic_api(&meta.gvk, meta.namespace.as_deref())
            .await?;
        let object: DynamicObject = serde_json::from_value(meta.value).map_err(|e| {
            Error::serialization_for_kind(&meta.gvk.kind, format!("invalid object: {e}"))
        })?;

        api.create(&self.post_params(), &object).await?;
        info!(
            kind = %meta.gvk.kind,
            name = %meta.name,
            namespace = meta.namespace.as_deref().unwrap_or(""),
            "Created object"
        );
        Ok(())
    }

    async fn list_by_label(
        &self,
        kind: ObjectKind,
        label: &str,
        scope: &ListScope,
    ) -> Result<Vec<DynamicObject>, Error> {
        let api = self.scoped_api(kind, scope).await?;
        Ok(api.list(&label_params(label)).await?.items)
    }

    async fn get_by_label(
        &self,
        kind: ObjectKind,
        label: &str,
        scope: &ListScope,
    ) -> Result<DynamicObject, Error> {
        let items = self.list_by_label(kind, label, scope).await?;
        exactly_one(kind.as_str(), label, items)
    }

    async fn patch_by_label(
        &self,
        kind: ObjectKind,
        label: &str,
        scope: &ListScope,
        patch: &[u8],
    ) -> Result<(), Error> {
        let object = self.get_by_label(kind, label, scope).await?;
        let name = object.name_any();
        let api = self
            .dynamic_api(&kind.gvk(), object.namespace().as_deref())
            .await?;
        api.patch(&name, &self.patch_params(), &Patch::Merge(merge_patch_value(patch)?))
            .await?;
        debug!(kind = %kind, name = %name, "Patched object");
        Ok(())
    }

    async fn delete_by_label(
        &self,
        kind: ObjectKind,
        label: &str,
        scope: &ListScope,
    ) -> Result<(), Error> {
        for object in self.list_by_label(kind, label, scope).await? {
            self.delete_by_name(kind, &object.name_any(), object.namespace())
                .await?;
        }
        Ok(())
    }

    async fn delete_by_name(
        &self,
        kind: ObjectKind,
        name: &str,
        namespace: Option<String>,
    ) -> Result<(), Error> {
        let api = self.dynamic_api(&kind.gvk(), namespace.as_deref()).await?;
        ignore_not_found(
            api.delete(name, &DeleteParams::default())
                .await
                .map(|_| ())
                .map_err(Error::from),
        )?;
        info!(kind = %kind, name = %name, namespace = namespace.as_deref().unwrap_or(""), "Deleted object");
        Ok(())
    }
}

#[async_trait]
impl DeploymentClient for KubeClusterClient {
    async fn list_deployments(
        &self,
        label: &str,
        scope: &ListScope,
    ) -> Result<Vec<Deployment>, Error> {
        let api: Api<Deployment> = match scope {
            ListScope::Namespace(ns) => Api::namespaced(self.client.clone(), ns),
            ListScope::AllNamespaces => Api::all(self.client.clone()),
        };
        Ok(api.list(&label_params(label)).await?.items)
    }

    async fn patch_deployment(
        &self,
        name: &str,
        namespace: &str,
        patch: &[u8],
    ) -> Result<(), Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &self.patch_params(), &Patch::Merge(merge_patch_value(patch)?))
            .await?;
        Ok(())
    }

    async fn delete_deployment(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(
            api.delete(name, &DeleteParams::default())
                .await
                .map(|_| ())
                .map_err(Error::from),
        )
    }
}

#[async_trait]
impl PodClient for KubeClusterClient {
    async fn get_pod_by_label(
        &self,
        label: &str,
        scope: &ListScope,
        phase: Option<PodPhase>,
    ) -> Result<Pod, Error> {
        let api: Api<Pod> = match scope {
            ListScope::Namespace(ns) => Api::namespaced(self.client.clone(), ns),
            ListScope::AllNamespaces => Api::all(self.client.clone()),
        };
        let mut params = label_params(label);
        if let Some(phase) = phase {
            params = params.fields(&format!("status.phase={}", phase.as_str()));
        }
        exactly_one("pod", label, api.list(&params).await?.items)
    }
}

#[async_trait]
impl CrdClient for KubeClusterClient {
    async fn crd_exists(&self, name: &str) -> Result<bool, Error> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn get_crd_conditions(
        &self,
        name: &str,
    ) -> Result<Vec<CustomResourceDefinitionCondition>, Error> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let crd = api.get(name).await?;
        Ok(crd
            .status
            .and_then(|s| s.conditions)
            .unwrap_or_default())
    }

    async fn delete_crd(&self, name: &str) -> Result<(), Error> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        ignore_not_found(
            api.delete(name, &DeleteParams::default())
                .await
                .map(|_| ())
                .map_err(Error::from),
        )
    }
}

#[async_trait]
impl OrchestratorClient for KubeClusterClient {
    async fn list_orchestrators(&self) -> Result<Vec<TridentOrchestrator>, Error> {
        let api: Api<TridentOrchestrator> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn update_orchestrator(
        &self,
        orchestrator: &TridentOrchestrator,
    ) -> Result<TridentOrchestrator, Error> {
        let api: Api<TridentOrchestrator> = Api::all(self.client.clone());
        Ok(api
            .replace(&orchestrator.name_any(), &self.post_params(), orchestrator)
            .await?)
    }

    async fn delete_orchestrator(&self, name: &str) -> Result<(), Error> {
        let api: Api<TridentOrchestrator> = Api::all(self.client.clone());
        ignore_not_found(
            api.delete(name, &DeleteParams::default())
                .await
                .map(|_| ())
                .map_err(Error::from),
        )
    }
}

#[async_trait]
impl StorageClient for KubeClusterClient {
    async fn get_storage_class(&self, name: &str) -> Result<StorageClass, Error> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        api.get_opt(name)
            .await?
            .ok_or_else(|| Error::not_found("storage class", name))
    }

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>, Error> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_storage_class(&self, name: &str, patch: &[u8]) -> Result<(), Error> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        api.patch(name, &self.patch_params(), &Patch::Merge(merge_patch_value(patch)?))
            .await?;
        Ok(())
    }

    async fn delete_storage_class(&self, name: &str) -> Result<(), Error> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        ignore_not_found(
            api.delete(name, &DeleteParams::default())
                .await
                .map(|_| ())
                .map_err(Error::from),
        )
    }

    async fn get_volume_snapshot_class(&self, name: &str) -> Result<DynamicObject, Error> {
        let api = self
            .dynamic_api(&ObjectKind::VolumeSnapshotClass.gvk(), None)
            .await?;
        api.get_opt(name)
            .await?
            .ok_or_else(|| Error::not_found(ObjectKind::VolumeSnapshotClass.as_str(), name))
    }

    async fn patch_volume_snapshot_class(&self, name: &str, patch: &[u8]) -> Result<(), Error> {
        let api = self
            .dynamic_api(&ObjectKind::VolumeSnapshotClass.gvk(), None)
            .await?;
        api.patch(name, &self.patch_params(), &Patch::Merge(merge_patch_value(patch)?))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_distinguishes_none_one_and_many() {
        let none: Result<u8, _> = exactly_one("deployment", "app=x", vec![]);
        assert!(none.unwrap_err().is_not_found());

        assert_eq!(exactly_one("deployment", "app=x", vec![7]).unwrap(), 7);

        let many = exactly_one("deployment", "app=x", vec![1, 2]).unwrap_err();
        assert!(matches!(many, Error::Ambiguous { ref kind, .. } if kind == "deployment"));
        assert!(many.to_string().contains("app=x"));
    }

    #[test]
    fn object_kinds_map_to_api_groups() {
        assert_eq!(ObjectKind::Secret.gvk().group, "");
        assert_eq!(ObjectKind::ClusterRole.gvk().group, "rbac.authorization.k8s.io");
        let vsc = ObjectKind::VolumeSnapshotClass.gvk();
        assert_eq!(vsc.group, "snapshot.storage.k8s.io");
        assert_eq!(vsc.kind, "VolumeSnapshotClass");
        assert_eq!(ObjectKind::ClusterRoleBinding.to_string(), "cluster role binding");
    }

    #[test]
    fn invalid_patch_bytes_are_serialization_errors() {
        assert!(matches!(
            merge_patch_value(b"not json"),
            Err(Error::Serialization { .. })
        ));
        assert_eq!(merge_patch_value(b"{}").unwrap(), serde_json::json!({}));
    }

    #[test]
    fn absent_objects_are_ignored_on_delete() {
        assert!(ignore_not_found(Err(Error::not_found("secret", "x"))).is_ok());
        assert!(ignore_not_found(Err(Error::internal("boom"))).is_err());
    }
}
