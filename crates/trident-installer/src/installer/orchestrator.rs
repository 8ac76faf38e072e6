//! The TridentOrchestrator this installer manages

use kube::ResourceExt;
use tracing::{debug, error, info};

use trident_common::crd::TridentOrchestrator;
use trident_common::Error;

use super::Installer;
use crate::manifests::{self, OrchestratorSettings};

impl Installer {
    /// Delete TridentOrchestrators in a terminal state and return the one
    /// left, if any
    pub(super) async fn remove_terminal_orchestrators(
        &self,
    ) -> Result<Option<TridentOrchestrator>, Error> {
        let crs = self.clients.orchestrators.list_orchestrators().await?;

        let mut remaining = Vec::new();
        let mut failed = Vec::new();
        for cr in crs {
            let status = cr.install_status();
            if !status.is_terminal() {
                remaining.push(cr);
                continue;
            }
            let name = cr.name_any();
            match self.clients.orchestrators.delete_orchestrator(&name).await {
                Ok(()) => info!(name = %name, status = %status, "Deleted TridentOrchestrator in a terminal state"),
                Err(e) => {
                    error!(name = %name, error = %e, "Could not delete TridentOrchestrator");
                    failed.push(name);
                }
            }
        }

        if remaining.len() > 1 {
            return Err(Error::ambiguous(
                "tridentorchestrator",
                format!(
                    "{} TridentOrchestrators not in a terminal state, waiting for the operator to resolve them",
                    remaining.len()
                ),
            ));
        }
        if !failed.is_empty() {
            return Err(Error::internal_with_context(
                "remove_terminal_orchestrators",
                format!("could not delete TridentOrchestrators: {}", failed.join(", ")),
            ));
        }
        Ok(remaining.pop())
    }

    /// Create the TridentOrchestrator, or reset the fields this installer
    /// owns on the existing one
    pub(super) async fn ensure_orchestrator(
        &self,
        current: Option<TridentOrchestrator>,
    ) -> Result<(), Error> {
        let settings = self.orchestrator_settings();

        let Some(mut cr) = current else {
            let manifest =
                manifests::to_yaml("TridentOrchestrator", &manifests::orchestrator_cr(&settings))?;
            self.clients.objects.create_object(&manifest).await?;
            info!(namespace = %self.namespace, trident_image = %settings.trident_image, "Created TridentOrchestrator");
            return Ok(());
        };

        let before = cr.spec.clone();
        settings.apply_to(&mut cr.spec);
        if cr.spec == before {
            debug!(name = %cr.name_any(), "TridentOrchestrator is up to date");
            return Ok(());
        }

        let updated = self.clients.orchestrators.update_orchestrator(&cr).await?;
        debug!(
            name = %updated.name_any(),
            namespace = %updated.spec.namespace,
            debug = updated.spec.debug,
            enable_acp = updated.spec.enable_acp,
            acp_image = %updated.spec.acp_image,
            log_format = %updated.spec.log_format,
            autosupport_image = %updated.spec.autosupport_image,
            trident_image = %updated.spec.trident_image,
            image_pull_secrets = ?updated.spec.image_pull_secrets,
            "Patched TridentOrchestrator"
        );
        Ok(())
    }

    fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            namespace: self.namespace.clone(),
            debug: self.options.debug,
            log_format: self.options.log_format.clone(),
            trident_image: self.images.trident.clone(),
            autosupport_image: self.images.autosupport.clone(),
            acp_image: self.images.acp.clone(),
            proxy_url: self.target.proxy_url.clone(),
            serial_number: self.target.serial_number.clone(),
            hostname: self.target.cluster_name.clone(),
        }
    }
}
