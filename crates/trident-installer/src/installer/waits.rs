//! Waits on the operator, the install it performs and the Trident controller

use std::time::Instant;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use trident_common::crd::OrchestratorStatus;
use trident_common::kube_utils::ListScope;
use trident_common::retry::wait_for;
use trident_common::{
    Error, OPERATOR_LABEL, OPERATOR_NAME, TRIDENT_CONTROLLER_CONTAINER, TRIDENT_CONTROLLER_LABEL,
};

use super::Installer;
use crate::client::PodPhase;
use crate::configure::tridentctl;

impl Installer {
    pub(super) async fn wait_for_operator(
        &self,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<(), Error> {
        let pods = &*self.clients.pods;
        let scope = &ListScope::namespace(&self.namespace);
        let image = self.images.operator.as_str();

        let pod = wait_for(
            &self.poll_backoff(deadline),
            cancel,
            "wait for trident-operator pod",
            move || async move {
                let pod = pods
                    .get_pod_by_label(OPERATOR_LABEL, scope, Some(PodPhase::Running))
                    .await?;
                check_pod(&pod, OPERATOR_NAME, image)?;
                Ok(pod)
            },
        )
        .await?;

        info!(pod = %pod.name_any(), namespace = %self.namespace, "trident-operator is running");
        Ok(())
    }

    /// Wait for the operator to report the install done.
    ///
    /// A TridentOrchestrator that vanished ends the wait with a retryable
    /// NotFound so the next run attempt creates it again.
    pub(super) async fn wait_for_install(
        &self,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<(), Error> {
        let orchestrators = &*self.clients.orchestrators;
        wait_for(
            &self.poll_backoff(deadline),
            cancel,
            "wait for trident install",
            move || async move {
                let crs = orchestrators.list_orchestrators().await?;
                match crs.as_slice() {
                    [] => Err(Error::permanent(Error::not_found(
                        "tridentorchestrator",
                        "TridentOrchestrator disappeared before the install finished",
                    ))),
                    [cr] => check_install_status(
                        &cr.install_status(),
                        cr.installed_image(),
                        &cr.spec.trident_image,
                        cr.status_message(),
                    ),
                    _ => Err(Error::ambiguous(
                        "tridentorchestrator",
                        format!("{} TridentOrchestrators found, expected one", crs.len()),
                    )),
                }
            },
        )
        .await?;
        info!("Trident installed by the operator");
        Ok(())
    }

    /// Wait for the Trident controller and check it answers `tridentctl`
    pub(super) async fn wait_for_controller(
        &self,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<Pod, Error> {
        let pods = &*self.clients.pods;
        let exec = &*self.clients.exec;
        let image = self.images.trident.as_str();

        let pod = wait_for(
            &self.poll_backoff(deadline),
            cancel,
            "wait for trident controller pod",
            move || async move {
                let pod = pods
                    .get_pod_by_label(
                        TRIDENT_CONTROLLER_LABEL,
                        &ListScope::AllNamespaces,
                        Some(PodPhase::Running),
                    )
                    .await?;
                check_pod(&pod, TRIDENT_CONTROLLER_CONTAINER, image)?;

                let name = pod.name_any();
                let namespace = pod.namespace().unwrap_or_default();
                let version = tridentctl(exec, &name, &namespace, &["version"]).await?;
                debug!(pod = %name, response = %String::from_utf8_lossy(&version), "Trident REST interface available");
                Ok(pod)
            },
        )
        .await?;

        info!(pod = %pod.name_any(), "Trident controller is running");
        Ok(pod)
    }
}

/// Check a pod runs `container` with `image`, ready and not terminating.
///
/// A pod spec naming another image is a hard error: it ends the wait and
/// the run.
pub(crate) fn check_pod(pod: &Pod, container: &str, image: &str) -> Result<(), Error> {
    let name = pod.name_any();
    if pod.metadata.deletion_timestamp.is_some() {
        return Err(Error::not_ready(format!("pod {name}"), "pod is terminating"));
    }

    let spec_image = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.containers.iter().find(|c| c.name == container))
        .map(|c| c.image.as_deref().unwrap_or_default());
    match spec_image {
        None => {
            return Err(Error::not_ready(
                format!("pod {name}"),
                format!("container {container} not found in pod spec"),
            ))
        }
        Some(actual) if actual != image => {
            return Err(Error::permanent(Error::ImageMismatch {
                resource: format!("pod {name}"),
                expected: image.to_string(),
                actual: actual.to_string(),
            }))
        }
        Some(_) => {}
    }

    let status = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|s| s.name == container));
    match status {
        None => Err(Error::not_ready(
            format!("pod {name}"),
            format!("container {container} has not reported status"),
        )),
        Some(s) if s.state.as_ref().and_then(|st| st.running.as_ref()).is_none() => Err(
            Error::not_ready(format!("pod {name}"), format!("container {container} is not running")),
        ),
        Some(s) if !s.ready => Err(Error::not_ready(
            format!("pod {name}"),
            format!("container {container} is not ready"),
        )),
        Some(_) => Ok(()),
    }
}

/// Classify a TridentOrchestrator's install status
pub(crate) fn check_install_status(
    status: &OrchestratorStatus,
    installed_image: Option<&str>,
    spec_image: &str,
    message: &str,
) -> Result<(), Error> {
    debug!(status = %status, "TridentOrchestrator status");
    match status {
        OrchestratorStatus::Installed => match installed_image {
            Some(installed) if installed == spec_image => Ok(()),
            other => Err(Error::not_ready(
                "tridentorchestrator",
                format!(
                    "status reports Trident image {} but the spec requires {spec_image}; {message}",
                    other.unwrap_or("<none>")
                ),
            )),
        },
        OrchestratorStatus::NoStatus => Err(Error::not_ready(
            "tridentorchestrator",
            "no status reported yet",
        )),
        OrchestratorStatus::Installing
        | OrchestratorStatus::Uninstalling
        | OrchestratorStatus::Updating => Err(Error::not_ready(
            "tridentorchestrator",
            format!("in a transitional state ({status}); {message}"),
        )),
        OrchestratorStatus::Failed => Err(Error::not_ready(
            "tridentorchestrator",
            format!("in a recoverable failed state ({status}); {message}"),
        )),
        OrchestratorStatus::Unknown(_) => Err(Error::not_ready(
            "tridentorchestrator",
            format!("in an unknown state ({status}); {message}"),
        )),
        OrchestratorStatus::Uninstalled
        | OrchestratorStatus::UninstalledAll
        | OrchestratorStatus::Error => Err(Error::permanent(Error::TerminalState {
            status: status.to_string(),
            message: message.to_string(),
        })),
    }
}
