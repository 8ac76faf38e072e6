//! Trident configuration for Cloud Volumes Service on Google Cloud
//!
//! Creates or updates the `gcp-cvs` backend with one virtual pool per
//! offered storage class, then creates or patches the matching storage
//! classes and the CVS volume snapshot class.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use trident_common::Error;

use super::{backend_names, tridentctl};
use crate::client::{ClusterClients, ObjectKind};
use crate::installer::patch_for;
use crate::manifests::{self, CvsStorageClass, DEFAULT_STORAGE_CLASS_ANNOTATION};
use crate::target::{GcpConfig, GcpPrivateKey, InstallTarget};

/// Backend name this installer creates
pub const BACKEND_NAME: &str = "gcp-astra";
/// Backend name used by earlier installers, updated in place when found
pub const LEGACY_BACKEND_NAME: &str = "gcp-polaris";
/// Volume snapshot class for CVS volumes
pub const SNAPSHOT_CLASS_NAME: &str = "netapp-cvs-snapshot-class";

const HARDWARE_STANDARD: &str = "netapp-cvs-perf-standard";
const HARDWARE_PREMIUM: &str = "netapp-cvs-perf-premium";
const HARDWARE_EXTREME: &str = "netapp-cvs-perf-extreme";
const SOFTWARE_STANDARD: &str = "netapp-cvs-standard";

/// A storage class this installer knows how to back
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CvsOffering {
    /// Storage class name
    pub name: &'static str,
    /// CVS service level of the backing pool
    pub service_level: &'static str,
    /// Hardware or software pool
    pub class: CvsStorageClass,
}

const OFFERINGS: [CvsOffering; 4] = [
    CvsOffering {
        name: HARDWARE_STANDARD,
        service_level: "standard",
        class: CvsStorageClass::Hardware,
    },
    CvsOffering {
        name: HARDWARE_PREMIUM,
        service_level: "premium",
        class: CvsStorageClass::Hardware,
    },
    CvsOffering {
        name: HARDWARE_EXTREME,
        service_level: "extreme",
        class: CvsStorageClass::Hardware,
    },
    CvsOffering {
        name: SOFTWARE_STANDARD,
        service_level: "standardsw",
        class: CvsStorageClass::Software,
    },
];

/// Storage classes offered in `region`.
///
/// Regions without an entry, or with an empty one, get the hardware
/// classes. Unknown class names are skipped.
pub fn offerings_for_region(gcp: &GcpConfig) -> Vec<CvsOffering> {
    let names: Vec<&str> = match gcp.region_storage_classes.get(&gcp.api_region) {
        Some(names) if !names.is_empty() => names.iter().map(String::as_str).collect(),
        _ => {
            warn!(region = %gcp.api_region, "No storage classes listed for region, defaulting to hardware CVS storage classes");
            vec![HARDWARE_STANDARD, HARDWARE_PREMIUM, HARDWARE_EXTREME]
        }
    };

    let offerings: Vec<CvsOffering> = names
        .into_iter()
        .filter_map(|name| {
            let offering = OFFERINGS.iter().find(|o| o.name == name).copied();
            if offering.is_none() {
                warn!(storage_class = %name, "Ignoring unknown CVS storage class");
            }
            offering
        })
        .collect();
    info!(
        region = %gcp.api_region,
        storage_classes = ?offerings.iter().map(|o| o.name).collect::<Vec<_>>(),
        "Determined region-based CVS storage classes"
    );
    offerings
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BackendConfig<'a> {
    version: u32,
    storage_driver_name: &'static str,
    backend_name: &'static str,
    project_number: &'a str,
    host_project_number: &'a str,
    api_key: &'a GcpPrivateKey,
    api_region: &'a str,
    #[serde(rename = "apiURL")]
    api_url: &'a str,
    #[serde(rename = "apiAudienceURL")]
    api_audience_url: &'a str,
    #[serde(rename = "proxyURL")]
    proxy_url: &'a str,
    nfs_mount_options: &'a str,
    network: &'a str,
    labels: BTreeMap<String, String>,
    storage: Vec<BackendPool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BackendPool {
    labels: BTreeMap<String, String>,
    service_level: String,
    storage_class: String,
}

/// Configures Trident for GCP once its controller is running
pub struct GcpConfigurer<'a> {
    clients: &'a ClusterClients,
    target: &'a InstallTarget,
    gcp: &'a GcpConfig,
    credentials: &'a GcpPrivateKey,
    pod: String,
    namespace: String,
}

impl<'a> GcpConfigurer<'a> {
    /// Prepare configuration against the given Trident controller pod.
    ///
    /// GCP credentials are required.
    pub fn new(
        clients: &'a ClusterClients,
        target: &'a InstallTarget,
        gcp: &'a GcpConfig,
        controller: &Pod,
    ) -> Result<Self, Error> {
        let credentials = gcp.credentials.as_ref().ok_or_else(|| {
            Error::validation("cannot configure Trident for GCP, no GCP credentials provided")
        })?;
        Ok(Self {
            clients,
            target,
            gcp,
            credentials,
            pod: controller.name_any(),
            namespace: controller.namespace().unwrap_or_default(),
        })
    }

    /// Backend, storage classes and snapshot class, in that order
    pub async fn configure(&self) -> Result<(), Error> {
        let offerings = offerings_for_region(self.gcp);

        self.ensure_backend(&offerings).await?;

        let default_class = self.default_storage_class().await?;
        for offering in &offerings {
            self.ensure_storage_class(offering, default_class.as_deref())
                .await?;
        }

        self.ensure_snapshot_class().await.map_err(|e| {
            Error::internal_with_context(
                "configure_gcp",
                format!("could not create volume snapshot class, check if volume snapshot CRDs exist; {e}"),
            )
        })
    }

    fn backend_config(&self, offerings: &[CvsOffering]) -> Result<String, Error> {
        let mut labels = BTreeMap::from([("cloud".to_string(), "gcp".to_string())]);
        labels.extend(self.target.labels.clone());

        let storage = offerings
            .iter()
            .map(|o| BackendPool {
                labels: BTreeMap::from([
                    ("serviceLevel".to_string(), o.service_level.to_string()),
                    ("storageClass".to_string(), o.class.as_str().to_string()),
                ]),
                service_level: o.service_level.to_string(),
                storage_class: o.class.as_str().to_string(),
            })
            .collect();

        let config = BackendConfig {
            version: 1,
            storage_driver_name: "gcp-cvs",
            backend_name: BACKEND_NAME,
            project_number: &self.gcp.project_number,
            host_project_number: &self.gcp.host_project_number,
            api_key: self.credentials,
            api_region: &self.gcp.api_region,
            api_url: &self.gcp.api_url,
            api_audience_url: &self.gcp.api_audience_url,
            proxy_url: &self.target.proxy_url,
            nfs_mount_options: &self.target.nfs_mount_options,
            network: &self.gcp.network,
            labels,
            storage,
        };
        let json = serde_json::to_vec(&config).map_err(|e| {
            Error::serialization_for_kind("backend", format!("failed to render GCP backend: {e}"))
        })?;
        Ok(STANDARD.encode(json))
    }

    async fn ensure_backend(&self, offerings: &[CvsOffering]) -> Result<(), Error> {
        let exec = &*self.clients.exec;
        let names = backend_names(exec, &self.pod, &self.namespace).await?;
        let existing = [BACKEND_NAME, LEGACY_BACKEND_NAME]
            .into_iter()
            .find(|candidate| names.iter().any(|n| n == candidate));

        let config = self.backend_config(offerings)?;
        match existing {
            Some(name) => {
                tridentctl(
                    exec,
                    &self.pod,
                    &self.namespace,
                    &["update", "backend", name, "--base64", &config],
                )
                .await?;
                info!(backend = %name, "Updated Trident GCP backend");
            }
            None => {
                tridentctl(
                    exec,
                    &self.pod,
                    &self.namespace,
                    &["create", "backend", "--base64", &config],
                )
                .await?;
                info!(backend = BACKEND_NAME, "Created Trident GCP backend");
            }
        }
        Ok(())
    }

    /// The target's default storage class, else the cluster's current one
    async fn default_storage_class(&self) -> Result<Option<String>, Error> {
        if let Some(name) = self
            .target
            .default_storage_class
            .as_ref()
            .filter(|s| !s.is_empty())
        {
            return Ok(Some(name.clone()));
        }
        let classes = self.clients.storage.list_storage_classes().await?;
        Ok(classes
            .iter()
            .find(|sc| {
                sc.annotations()
                    .get(DEFAULT_STORAGE_CLASS_ANNOTATION)
                    .is_some_and(|v| v == "true")
            })
            .map(|sc| sc.name_any()))
    }

    async fn ensure_storage_class(
        &self,
        offering: &CvsOffering,
        default_class: Option<&str>,
    ) -> Result<(), Error> {
        let is_default = default_class == Some(offering.name);
        let manifest = manifests::to_yaml(
            "StorageClass",
            &manifests::gcp_storage_class(
                offering.name,
                offering.service_level,
                offering.class,
                is_default,
            ),
        )?;
        info!(
            storage_class = offering.name,
            is_default,
            class = offering.class.as_str(),
            service_level = offering.service_level,
            "Creating or patching storage class"
        );

        let storage = &*self.clients.storage;
        match storage.get_storage_class(offering.name).await {
            Ok(current) => {
                let patched = match patch_for(&current, &manifest) {
                    Ok(Some(patch)) => storage.patch_storage_class(offering.name, &patch).await,
                    Ok(None) => {
                        debug!(storage_class = offering.name, "Storage class is up to date");
                        return Ok(());
                    }
                    Err(e) => Err(e),
                };
                match patched {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        error!(storage_class = offering.name, error = %e, "Could not patch storage class, will delete and recreate");
                    }
                }
                storage.delete_storage_class(offering.name).await?;
                info!(storage_class = offering.name, "Deleted storage class");
            }
            Err(e) if e.is_not_found() => {
                info!(storage_class = offering.name, "Storage class not found");
            }
            Err(e) => return Err(e),
        }

        self.clients.objects.create_object(&manifest).await?;
        info!(storage_class = offering.name, "Created storage class");
        Ok(())
    }

    async fn ensure_snapshot_class(&self) -> Result<(), Error> {
        let manifest = serde_json::to_string(&manifests::volume_snapshot_class(SNAPSHOT_CLASS_NAME))
            .map_err(|e| {
                Error::serialization_for_kind(
                    "VolumeSnapshotClass",
                    format!("failed to render manifest: {e}"),
                )
            })?;

        let storage = &*self.clients.storage;
        match storage.get_volume_snapshot_class(SNAPSHOT_CLASS_NAME).await {
            Ok(current) => match patch_for(&current, &manifest)? {
                Some(patch) => {
                    storage
                        .patch_volume_snapshot_class(SNAPSHOT_CLASS_NAME, &patch)
                        .await?;
                    info!(name = SNAPSHOT_CLASS_NAME, "Patched volume snapshot class");
                }
                None => debug!(name = SNAPSHOT_CLASS_NAME, "Volume snapshot class is up to date"),
            },
            Err(e) if e.is_not_found() => {
                self.clients.objects.create_object(&manifest).await?;
                info!(kind = %ObjectKind::VolumeSnapshotClass, name = SNAPSHOT_CLASS_NAME, "Created volume snapshot class");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}
