//! Installation state machine
//!
//! An [`Installer`] is built once per install target. Construction resolves
//! images, gates the operator version and locates an existing operator
//! without touching the cluster's state. [`Installer::run`] then drives the
//! phases in order, retrying the whole sequence until it converges or the
//! time budget runs out:
//!
//! 1. namespace
//! 2. RBAC objects
//! 3. TridentOrchestrator CRD, waited on until established
//! 4. image pull secret
//! 5. operator deployment
//! 6. operator pod, waited on until running with the expected image
//! 7. removal of TridentOrchestrators in a terminal state
//! 8. the managed TridentOrchestrator
//! 9. the operator's install status
//! 10. Trident controller pod, waited on until it answers `tridentctl`
//! 11. cloud provider configuration
//!
//! Every phase is idempotent. Objects found in the cluster are patched with a
//! merge patch, and patches that change nothing are not sent.

mod orchestrator;
mod resources;
mod waits;


use std::future::Future;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trident_common::crd::TridentOrchestrator;
use trident_common::kube_utils::ListScope;
use trident_common::patch::{is_empty_patch, merge_patch};
use trident_common::retry::{wait_for, BackoffConfig};
use trident_common::version::{version_from_image, Version};
use trident_common::{
    Error, K8S_TIMEOUT, OPERATOR_LABEL, OPERATOR_MIN_VERSION, OPERATOR_NAME, OPERATOR_NAMESPACE,
};

use crate::client::{exactly_one, ClusterClients, PodPhase};
use crate::configure::gcp::GcpConfigurer;
use crate::images::{ImageDefaults, ResolvedImages};
use crate::target::{CloudProvider, InstallTarget};

/// Docker config used when neither the target nor the caller supplies one
const EMPTY_DOCKER_CONFIG: &[u8] = br#"{"auths":{}}"#;

/// Knobs for an installation run
#[derive(Clone, Debug)]
pub struct InstallerOptions {
    /// Budget for one run. Waits inside the run never outlast it
    pub timeout: Duration,
    /// Backoff between whole-run attempts
    pub run_backoff: BackoffConfig,
    /// Backoff used while waiting on cluster state, clipped to what is left
    /// of the run's budget
    pub poll_backoff: BackoffConfig,
    /// Log format passed to the operator and to Trident
    pub log_format: String,
    /// Run the operator and Trident with debug logging
    pub debug: bool,
    /// Images used when the target does not name one
    pub image_defaults: ImageDefaults,
    /// `.dockerconfigjson` used when the target carries no pull secret
    pub registry_credentials: Option<Vec<u8>>,
}

impl Default for InstallerOptions {
    fn default() -> Self {
        Self::with_timeout(K8S_TIMEOUT)
    }
}

impl InstallerOptions {
    /// Default options with every time budget set to `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            run_backoff: BackoffConfig::default().with_max_elapsed(timeout),
            poll_backoff: BackoffConfig::polling(timeout),
            log_format: "text".to_string(),
            debug: true,
            image_defaults: ImageDefaults::default(),
            registry_credentials: None,
        }
    }
}

/// Installs the Trident operator and drives it to a running Trident
pub struct Installer {
    clients: ClusterClients,
    target: InstallTarget,
    options: InstallerOptions,
    images: ResolvedImages,
    namespace: String,
    pull_secret: Vec<u8>,
    expected_version: Version,
    existing_version: Option<Version>,
}

impl Installer {
    /// Prepare an installation.
    ///
    /// Settings that can be judged from the target alone are checked before
    /// any cluster call. The cluster is then only read: an existing operator
    /// is located so its namespace can be adopted.
    pub async fn new(
        clients: ClusterClients,
        target: InstallTarget,
        options: InstallerOptions,
    ) -> Result<Self, Error> {
        target.validate()?;
        let images = ResolvedImages::resolve(&target, &options.image_defaults)?;
        let pull_secret = pull_secret_bytes(&target, &options)?;

        let expected_version = version_from_image(&images.operator)?;
        expected_version
            .to_major_minor()
            .ensure_at_least(&Version::parse(OPERATOR_MIN_VERSION)?)?;

        let (namespace, operator_found) = find_operator_namespace(&clients).await?;
        let existing_version = if operator_found {
            existing_operator_version(&clients, &namespace).await
        } else {
            None
        };

        if target.provider().is_none() {
            debug!("Installer configured with no cloud provider");
        }
        debug!(
            namespace = %namespace,
            expected_operator_version = %expected_version,
            existing_operator_version = ?existing_version.as_ref().map(ToString::to_string),
            "Initialized installer"
        );

        Ok(Self {
            clients,
            target,
            options,
            images,
            namespace,
            pull_secret,
            expected_version,
            existing_version,
        })
    }

    /// Namespace the operator is installed into
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Images this installer deploys
    pub fn images(&self) -> &ResolvedImages {
        &self.images
    }

    /// Version of the operator this installer deploys
    pub fn expected_operator_version(&self) -> &Version {
        &self.expected_version
    }

    /// Version of the operator found running at construction, if any
    pub fn existing_operator_version(&self) -> Option<&Version> {
        self.existing_version.as_ref()
    }

    /// Install or update Trident and wait for it to come up.
    ///
    /// Transient failures restart the phase sequence with backoff. Ambiguous
    /// cluster state, a TridentOrchestrator in a terminal state, a wait that
    /// ran out of time, or cancellation end the run.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let start = Instant::now();
        let deadline = start + self.options.run_backoff.max_elapsed;
        match &self.existing_version {
            Some(existing) if existing.less_than(&self.expected_version) => info!(
                from = %existing,
                to = %self.expected_version,
                "Upgrading trident-operator"
            ),
            _ => {}
        }
        info!(
            namespace = %self.namespace,
            operator_image = %self.images.operator,
            trident_image = %self.images.trident,
            "Starting Trident installation"
        );

        let mut attempt = 0u32;
        wait_for(
            &self.options.run_backoff,
            cancel,
            "install trident",
            move || {
                attempt += 1;
                let attempt = attempt;
                async move {
                    debug!(attempt, "Installation attempt");
                    self.run_once(cancel, deadline).await.map_err(|e| {
                        if e.is_retryable() {
                            e
                        } else {
                            Error::permanent(e)
                        }
                    })
                }
            },
        )
        .await?;

        info!(
            namespace = %self.namespace,
            elapsed_secs = start.elapsed().as_secs_f64(),
            "Trident installation complete"
        );
        Ok(())
    }

    /// The single TridentOrchestrator in the cluster.
    ///
    /// NotFound when there is none and Ambiguous when there are several.
    pub async fn managed_cr(&self) -> Result<TridentOrchestrator, Error> {
        let mut crs = self.clients.orchestrators.list_orchestrators().await?;
        match crs.len() {
            0 => Err(Error::not_found(
                "tridentorchestrator",
                "no TridentOrchestrator found, expected one",
            )),
            1 => Ok(crs.remove(0)),
            n => Err(Error::ambiguous(
                "tridentorchestrator",
                format!("{n} TridentOrchestrators found, expected one"),
            )),
        }
    }

    async fn run_once(&self, cancel: &CancellationToken, deadline: Instant) -> Result<(), Error> {
        self.phase("create namespace", self.ensure_namespace())
            .await?;
        self.phase("create RBAC objects", self.ensure_rbac()).await?;
        self.phase("create CRD", self.ensure_crd(cancel, deadline)).await?;
        self.phase("create image pull secret", self.ensure_pull_secret())
            .await?;
        self.phase(
            "create operator deployment",
            self.ensure_operator_deployment(),
        )
        .await?;
        self.phase("wait for operator", self.wait_for_operator(cancel, deadline))
            .await?;
        let current = self
            .phase(
                "clean up tridentorchestrators",
                self.remove_terminal_orchestrators(),
            )
            .await?;
        self.phase("create tridentorchestrator", self.ensure_orchestrator(current))
            .await?;
        self.phase("wait for trident install", self.wait_for_install(cancel, deadline))
            .await?;
        let controller = self
            .phase("wait for trident controller", self.wait_for_controller(cancel, deadline))
            .await?;
        self.phase("configure cloud provider", self.configure(&controller))
            .await
    }

    /// Poll backoff for a wait that must end by `deadline`
    fn poll_backoff(&self, deadline: Instant) -> BackoffConfig {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let budget = self.options.poll_backoff.max_elapsed.min(remaining);
        self.options.poll_backoff.clone().with_max_elapsed(budget)
    }

    async fn phase<T, F>(&self, name: &str, step: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        info!(phase = name, namespace = %self.namespace, "Running installation phase");
        step.await.map_err(|e| Error::in_phase(name, e))
    }

    async fn configure(&self, controller: &Pod) -> Result<(), Error> {
        match self.target.provider() {
            Some(CloudProvider::Gcp(gcp)) => {
                GcpConfigurer::new(&self.clients, &self.target, gcp, controller)?
                    .configure()
                    .await
            }
            Some(CloudProvider::Anf(anf)) => {
                info!(location = %anf.location, "ANF configured; no backend configuration is performed");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Merge patch turning `current` into the desired manifest.
///
/// `None` when nothing would change. `apiVersion` and `kind` are never
/// patched. Only fields the manifest sets are compared, so values the API
/// server defaults on a live object do not produce a patch.
pub(crate) fn patch_for<T: Serialize + ?Sized>(
    current: &T,
    manifest: &str,
) -> Result<Option<Vec<u8>>, Error> {
    let patch = merge_patch(current, manifest)?;
    let mut value: Value = serde_json::from_slice(&patch)
        .map_err(|e| Error::serialization(format!("invalid merge patch: {e}")))?;
    if let Some(fields) = value.as_object_mut() {
        fields.remove("apiVersion");
        fields.remove("kind");
    }
    let patch = serde_json::to_vec(&value)
        .map_err(|e| Error::serialization(format!("failed to serialize patch: {e}")))?;
    Ok((!is_empty_patch(&patch)).then_some(patch))
}

fn pull_secret_bytes(target: &InstallTarget, options: &InstallerOptions) -> Result<Vec<u8>, Error> {
    if let Some(encoded) = target.image_pull_secret.as_deref().filter(|s| !s.is_empty()) {
        return STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::validation(format!("image pull secret is not valid base64: {e}")));
    }
    Ok(options
        .registry_credentials
        .clone()
        .unwrap_or_else(|| EMPTY_DOCKER_CONFIG.to_vec()))
}

/// Namespace of the existing operator deployment, or the default one
async fn find_operator_namespace(clients: &ClusterClients) -> Result<(String, bool), Error> {
    let deployments = clients
        .deployments
        .list_deployments(OPERATOR_LABEL, &ListScope::AllNamespaces)
        .await?;
    match exactly_one("deployment", OPERATOR_LABEL, deployments) {
        Ok(deployment) => {
            let namespace = deployment
                .metadata
                .namespace
                .unwrap_or_else(|| OPERATOR_NAMESPACE.to_string());
            info!(namespace = %namespace, "Found existing trident-operator");
            Ok((namespace, true))
        }
        Err(e) if e.is_not_found() => Ok((OPERATOR_NAMESPACE.to_string(), false)),
        Err(Error::Ambiguous { kind, .. }) => Err(Error::ambiguous(
            kind,
            "trident-operator found in multiple namespaces",
        )),
        Err(e) => Err(e),
    }
}

async fn existing_operator_version(clients: &ClusterClients, namespace: &str) -> Option<Version> {
    let lookup = async {
        let pod = clients
            .pods
            .get_pod_by_label(
                OPERATOR_LABEL,
                &ListScope::namespace(namespace),
                Some(PodPhase::Running),
            )
            .await?;
        let image = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.containers.iter().find(|c| c.name == OPERATOR_NAME))
            .and_then(|c| c.image.clone())
            .ok_or_else(|| {
                Error::not_found("container", "trident-operator container has no image")
            })?;
        version_from_image(&image)
    };
    match lookup.await {
        Ok(version) => Some(version),
        Err(e) if e.is_not_found() => None,
        Err(e) => {
            warn!(namespace = %namespace, error = %e, "Could not determine existing trident-operator version");
            None
        }
    }
}
