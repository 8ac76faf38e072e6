//! Create-or-patch of the objects the operator needs to run

use std::time::Instant;

use kube::api::DynamicObject;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trident_common::discovery::ClusterFlavor;
use trident_common::kube_utils::{parse_manifest, ListScope};
use trident_common::retry::wait_for;
use trident_common::{Error, IMAGE_PULL_SECRET_NAME, OPERATOR_LABEL, OPERATOR_NAME, ORCHESTRATOR_CRD_NAME};

use super::{patch_for, Installer};
use crate::client::{exactly_one, ObjectKind};
use crate::manifests;

impl Installer {
    pub(super) async fn ensure_namespace(&self) -> Result<(), Error> {
        if self.clients.namespaces.namespace_exists(&self.namespace).await? {
            debug!(namespace = %self.namespace, "Namespace exists");
            return Ok(());
        }
        let manifest = manifests::to_yaml("Namespace", &manifests::namespace(&self.namespace))?;
        self.clients.objects.create_object(&manifest).await?;
        info!(namespace = %self.namespace, "Created namespace");
        Ok(())
    }

    pub(super) async fn ensure_rbac(&self) -> Result<(), Error> {
        let service_account =
            manifests::to_yaml("ServiceAccount", &manifests::service_account(&self.namespace))?;
        self.ensure_namespaced_object(ObjectKind::ServiceAccount, &service_account)
            .await?;

        let flavor = self.clients.flavor;
        self.ensure_cluster_object(
            ObjectKind::ClusterRole,
            &manifests::cluster_role_manifest(flavor)?,
            &manifests::cluster_role_manifest(ClusterFlavor::Kubernetes)?,
        )
        .await?;
        self.ensure_cluster_object(
            ObjectKind::ClusterRoleBinding,
            &manifests::cluster_role_binding_manifest(flavor, &self.namespace)?,
            &manifests::cluster_role_binding_manifest(ClusterFlavor::Kubernetes, &self.namespace)?,
        )
        .await
    }

    pub(super) async fn ensure_crd(
        &self,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<(), Error> {
        if self.clients.crds.crd_exists(ORCHESTRATOR_CRD_NAME).await? {
            debug!(crd = ORCHESTRATOR_CRD_NAME, "CRD exists");
        } else {
            let manifest =
                manifests::to_yaml("CustomResourceDefinition", &manifests::orchestrator_crd())?;
            self.clients.objects.create_object(&manifest).await?;
            info!(crd = ORCHESTRATOR_CRD_NAME, "Created CRD");
        }

        let crds = &*self.clients.crds;
        wait_for(
            &self.poll_backoff(deadline),
            cancel,
            "wait for tridentorchestrator CRD",
            move || async move {
                let conditions = crds.get_crd_conditions(ORCHESTRATOR_CRD_NAME).await?;
                let established = conditions
                    .iter()
                    .any(|c| c.type_ == "Established" && c.status == "True");
                if established {
                    Ok(())
                } else {
                    Err(Error::not_ready(ORCHESTRATOR_CRD_NAME, "CRD is not yet established"))
                }
            },
        )
        .await?;
        debug!(crd = ORCHESTRATOR_CRD_NAME, "CRD established");
        Ok(())
    }

    pub(super) async fn ensure_pull_secret(&self) -> Result<(), Error> {
        self.remove_stale_pull_secrets().await;
        let manifest = manifests::to_yaml(
            "Secret",
            &manifests::image_pull_secret(&self.namespace, &self.pull_secret),
        )?;
        self.ensure_namespaced_object(ObjectKind::Secret, &manifest)
            .await
    }

    pub(super) async fn ensure_operator_deployment(&self) -> Result<(), Error> {
        let manifest = manifests::to_yaml(
            "Deployment",
            &manifests::operator_deployment(
                &self.namespace,
                &self.images.operator,
                &self.options.log_format,
                self.options.debug,
            ),
        )?;

        let deployments = self
            .clients
            .deployments
            .list_deployments(OPERATOR_LABEL, &ListScope::AllNamespaces)
            .await?;
        let current = match exactly_one("deployment", OPERATOR_LABEL, deployments) {
            Ok(current) => current,
            Err(e) if e.is_not_found() => {
                self.clients.objects.create_object(&manifest).await?;
                info!(namespace = %self.namespace, "Created trident-operator deployment");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let name = current.name_any();
        let namespace = current.namespace().unwrap_or_default();
        if namespace == self.namespace && name == OPERATOR_NAME {
            match patch_for(&current, &manifest)? {
                Some(patch) => {
                    self.clients
                        .deployments
                        .patch_deployment(&name, &namespace, &patch)
                        .await?;
                    info!(namespace = %namespace, "Patched trident-operator deployment");
                }
                None => debug!(namespace = %namespace, "trident-operator deployment is up to date"),
            }
            return Ok(());
        }

        warn!(
            name = %name,
            namespace = %namespace,
            expected_namespace = %self.namespace,
            "Replacing trident-operator deployment found outside the operator namespace"
        );
        self.clients
            .deployments
            .delete_deployment(&name, &namespace)
            .await?;
        self.clients.objects.create_object(&manifest).await?;
        info!(namespace = %self.namespace, "Created trident-operator deployment");
        Ok(())
    }

    /// Delete labelled pull secrets not under the canonical name.
    ///
    /// Failures are logged; the canonical secret is still ensured.
    async fn remove_stale_pull_secrets(&self) {
        let secrets = match self
            .clients
            .objects
            .list_by_label(
                ObjectKind::Secret,
                OPERATOR_LABEL,
                &ListScope::namespace(&self.namespace),
            )
            .await
        {
            Ok(secrets) => secrets,
            Err(e) => {
                warn!(error = %e, "Could not list image pull secrets");
                return;
            }
        };

        for secret in secrets
            .iter()
            .filter(|s| s.name_any() != IMAGE_PULL_SECRET_NAME)
        {
            let name = secret.name_any();
            match self
                .clients
                .objects
                .delete_by_name(ObjectKind::Secret, &name, Some(self.namespace.clone()))
                .await
            {
                Ok(()) => info!(secret = %name, "Deleted legacy image pull secret"),
                Err(e) => warn!(secret = %name, error = %e, "Could not delete legacy image pull secret"),
            }
        }
    }

    /// Create or patch a namespaced object found by the operator label.
    ///
    /// Copies in other namespaces are deleted. A copy in the operator
    /// namespace under another name is replaced.
    async fn ensure_namespaced_object(&self, kind: ObjectKind, manifest: &str) -> Result<(), Error> {
        let desired = parse_manifest(manifest)?;
        let objects = self
            .clients
            .objects
            .list_by_label(kind, OPERATOR_LABEL, &ListScope::AllNamespaces)
            .await?;
        let (local, foreign): (Vec<DynamicObject>, Vec<DynamicObject>) = objects
            .into_iter()
            .partition(|o| o.namespace().as_deref() == Some(self.namespace.as_str()));

        for object in foreign {
            let name = object.name_any();
            warn!(
                kind = %kind,
                name = %name,
                namespace = object.namespace().as_deref().unwrap_or(""),
                "Deleting object found outside the operator namespace"
            );
            self.clients
                .objects
                .delete_by_name(kind, &name, object.namespace())
                .await?;
        }

        match local.as_slice() {
            [] => {
                self.clients.objects.create_object(manifest).await?;
                info!(kind = %kind, name = %desired.name, namespace = %self.namespace, "Created object");
            }
            [current] if current.name_any() == desired.name => {
                match patch_for(current, manifest)? {
                    Some(patch) => {
                        self.clients
                            .objects
                            .patch_by_label(
                                kind,
                                OPERATOR_LABEL,
                                &ListScope::namespace(&self.namespace),
                                &patch,
                            )
                            .await?;
                        info!(kind = %kind, name = %desired.name, "Patched object");
                    }
                    None => debug!(kind = %kind, name = %desired.name, "Object is up to date"),
                }
            }
            [current] => {
                let name = current.name_any();
                warn!(kind = %kind, name = %name, expected = %desired.name, "Replacing object with unexpected name");
                self.clients
                    .objects
                    .delete_by_name(kind, &name, Some(self.namespace.clone()))
                    .await?;
                self.clients.objects.create_object(manifest).await?;
                info!(kind = %kind, name = %desired.name, namespace = %self.namespace, "Created object");
            }
            _ => {
                return Err(Error::ambiguous(
                    kind.as_str(),
                    format!(
                        "{} objects of kind {kind} have the label {OPERATOR_LABEL} in namespace {}",
                        local.len(),
                        self.namespace
                    ),
                ))
            }
        }
        Ok(())
    }

    /// Create or patch a cluster-scoped object found by the operator label.
    ///
    /// Creation uses the flavor's manifest. Patches are computed against
    /// `patch_manifest`, which addresses the object the way it is read back.
    async fn ensure_cluster_object(
        &self,
        kind: ObjectKind,
        manifest: &str,
        patch_manifest: &str,
    ) -> Result<(), Error> {
        match self
            .clients
            .objects
            .get_by_label(kind, OPERATOR_LABEL, &ListScope::AllNamespaces)
            .await
        {
            Ok(current) => match patch_for(&current, patch_manifest)? {
                Some(patch) => {
                    self.clients
                        .objects
                        .patch_by_label(kind, OPERATOR_LABEL, &ListScope::AllNamespaces, &patch)
                        .await?;
                    info!(kind = %kind, name = %current.name_any(), "Patched object");
                }
                None => debug!(kind = %kind, name = %current.name_any(), "Object is up to date"),
            },
            Err(e) if e.is_not_found() => {
                self.clients.objects.create_object(manifest).await?;
                info!(kind = %kind, "Created object");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}
