//! Kind-to-resource resolution backed by API discovery
//!
//! Manifests name a group, version and kind; the dynamic API needs the
//! plural resource name and whether the kind is namespaced. The
//! [`DynamicResourceResolver`] answers that from a cache filled by one bulk
//! discovery pass at start. A kind missing from the cache triggers exactly
//! one targeted query for its group/version, never another bulk pass, so
//! CRDs registered after start-up (like the TridentOrchestrator CRD the
//! installer itself creates) still resolve.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::GroupVersionKind;
use kube::discovery::{ApiResource, Discovery, Scope};
use kube::Client;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// A resource advertised by the API server for one group/version
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredResource {
    /// Kind (e.g., "VolumeSnapshotClass")
    pub kind: String,
    /// Plural resource name used in URLs (e.g., "volumesnapshotclasses")
    pub plural: String,
    /// Whether objects of this kind live in a namespace
    pub namespaced: bool,
}

/// Everything the API server advertises for one group/version
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupVersionResources {
    /// `group/version`, or just `version` for the core group
    pub group_version: String,
    /// Resources served under it, subresources excluded
    pub resources: Vec<DiscoveredResource>,
}

/// A kind resolved to what the dynamic API needs to address it
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedResource {
    /// Group, version, kind and plural for `Api::<DynamicObject>`
    pub api_resource: ApiResource,
    /// Whether the kind is namespaced
    pub namespaced: bool,
}

/// Flavor of the cluster, detected from its API groups
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClusterFlavor {
    /// Upstream Kubernetes
    #[default]
    Kubernetes,
    /// OpenShift, which serves its own RBAC API group
    OpenShift,
}

impl ClusterFlavor {
    /// Detect the flavor from a list of served group/versions
    pub fn detect<S: AsRef<str>>(group_versions: &[S]) -> Self {
        if group_versions
            .iter()
            .any(|gv| gv.as_ref().contains("openshift"))
        {
            ClusterFlavor::OpenShift
        } else {
            ClusterFlavor::Kubernetes
        }
    }
}

/// Source of API discovery data
///
/// Abstracts the discovery endpoints so the resolver can be tested without
/// an API server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// List every group/version the server advertises, with its resources
    async fn list_all(&self) -> Result<Vec<GroupVersionResources>, Error>;

    /// List the resources of a single group/version
    async fn list_group_version(&self, group_version: &str)
        -> Result<GroupVersionResources, Error>;
}

/// Discovery against a live API server
pub struct KubeDiscoveryClient {
    client: Client,
}

impl KubeDiscoveryClient {
    /// Create a discovery client over the given kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DiscoveryClient for KubeDiscoveryClient {
    async fn list_all(&self) -> Result<Vec<GroupVersionResources>, Error> {
        let discovery = Discovery::new(self.client.clone()).run().await?;

        let mut all = Vec::new();
        for group in discovery.groups() {
            for version in group.versions() {
                let resources = group
                    .versioned_resources(version)
                    .into_iter()
                    .map(|(ar, caps)| DiscoveredResource {
                        kind: ar.kind,
                        plural: ar.plural,
                        namespaced: matches!(caps.scope, Scope::Namespaced),
                    })
                    .collect();
                all.push(GroupVersionResources {
                    group_version: group_version(group.name(), version),
                    resources,
                });
            }
        }
        Ok(all)
    }

    async fn list_group_version(
        &self,
        group_version: &str,
    ) -> Result<GroupVersionResources, Error> {
        let list = if group_version.contains('/') {
            self.client.list_api_group_resources(group_version).await?
        } else {
            self.client.list_core_api_resources(group_version).await?
        };

        let resources = list
            .resources
            .into_iter()
            .filter(|r| !r.name.contains('/'))
            .map(|r| DiscoveredResource {
                kind: r.kind,
                plural: r.name,
                namespaced: r.namespaced,
            })
            .collect();

        Ok(GroupVersionResources {
            group_version: group_version.to_string(),
            resources,
        })
    }
}

/// Resolves kinds to API resources through a shared discovery cache
///
/// The cache maps a group/version to the resource list the server
/// advertised for it. Entries are only ever replaced by a fresh server
/// answer for the same key, so concurrent refreshes are harmless.
pub struct DynamicResourceResolver {
    discovery: Arc<dyn DiscoveryClient>,
    cache: RwLock<HashMap<String, Arc<GroupVersionResources>>>,
}

impl DynamicResourceResolver {
    /// Create a resolver with an empty cache
    pub fn new(discovery: Arc<dyn DiscoveryClient>) -> Self {
        Self {
            discovery,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Create a resolver backed by a live API server
    pub fn from_client(client: Client) -> Self {
        Self::new(Arc::new(KubeDiscoveryClient::new(client)))
    }

    /// Fill the cache with one bulk discovery pass.
    ///
    /// A failure only loses the head start: later lookups fall back to
    /// targeted refreshes.
    pub async fn warm(&self) {
        match self.discovery.list_all().await {
            Ok(all) => {
                let count = all.len();
                let mut cache = self.cache.write();
                for gvr in all {
                    cache.insert(gvr.group_version.clone(), Arc::new(gvr));
                }
                info!(group_versions = count, "Cached API discovery");
            }
            Err(e) => {
                warn!(error = %e, "Bulk API discovery failed, resolving kinds on demand");
            }
        }
    }

    /// Resolve a kind to its API resource.
    ///
    /// A cache miss triggers one query for the kind's group/version and one
    /// more lookup. A kind the server does not advertise is
    /// [`Error::NotFound`].
    pub async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedResource, Error> {
        let gv = group_version(&gvk.group, &gvk.version);

        if let Some(found) = self.lookup(&gv, gvk) {
            return Ok(found);
        }

        debug!(group_version = %gv, kind = %gvk.kind, "Kind not cached, refreshing group/version");
        let fresh = match self.discovery.list_group_version(&gv).await {
            Ok(fresh) => fresh,
            Err(e) if e.is_not_found() => {
                return Err(Error::not_found(
                    "api resource",
                    format!("group/version {gv} is not served"),
                ));
            }
            Err(e) => return Err(e),
        };
        self.cache.write().insert(gv.clone(), Arc::new(fresh));

        self.lookup(&gv, gvk).ok_or_else(|| {
            Error::not_found(
                "api resource",
                format!("kind {} is not served by {gv}", gvk.kind),
            )
        })
    }

    /// Group/versions currently in the cache
    pub fn cached_group_versions(&self) -> Vec<String> {
        let mut gvs: Vec<String> = self.cache.read().keys().cloned().collect();
        gvs.sort();
        gvs
    }

    /// Cluster flavor according to the cached discovery data
    pub fn flavor(&self) -> ClusterFlavor {
        ClusterFlavor::detect(&self.cached_group_versions())
    }

    fn lookup(&self, gv: &str, gvk: &GroupVersionKind) -> Option<ResolvedResource> {
        let entry = self.cache.read().get(gv).cloned()?;
        entry
            .resources
            .iter()
            .find(|r| r.kind == gvk.kind)
            .map(|r| ResolvedResource {
                api_resource: ApiResource {
                    group: gvk.group.clone(),
                    version: gvk.version.clone(),
                    api_version: gv.to_string(),
                    kind: r.kind.clone(),
                    plural: r.plural.clone(),
                },
                namespaced: r.namespaced,
            })
    }
}

fn group_version(group: &str, version: &str) -> String {
    if group.is_empty() {
        version.to_string()
    } else {
        format!("{group}/{version}")
    }
}
