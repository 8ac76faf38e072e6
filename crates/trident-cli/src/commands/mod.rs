//! CLI commands

pub mod install;
pub mod status;

use std::path::Path;

use tracing::debug;

use trident_common::kube_utils;
use trident_installer::{ClusterClients, InstallTarget};

use crate::{Error, Result};

/// Read and validate an [`InstallTarget`] YAML file
pub fn load_target(path: &Path) -> Result<InstallTarget> {
    let yaml = std::fs::read_to_string(path).map_err(|e| {
        Error::validation(format!(
            "cannot read install target {}: {}",
            path.display(),
            e
        ))
    })?;
    let target = InstallTarget::from_yaml(&yaml)?;
    target.validate()?;
    debug!(path = %path.display(), "Loaded install target");
    Ok(target)
}

/// Connect to the cluster named by `kubeconfig`, or the inferred one
pub async fn connect(kubeconfig: Option<&Path>) -> Result<ClusterClients> {
    let client = kube_utils::create_client(kubeconfig).await?;
    Ok(ClusterClients::connect(client).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_target() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "clusterName: prod-east\ntridentImage: registry/trident:24.01.0"
        )
        .unwrap();

        let target = load_target(file.path()).unwrap();
        assert_eq!(target.cluster_name, "prod-east");
        assert_eq!(target.trident_image.as_deref(), Some("registry/trident:24.01.0"));
    }

    #[test]
    fn test_load_target_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_target(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("absent.yaml"));
    }

    #[test]
    fn test_load_target_rejects_two_providers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "gcp:\n  projectNumber: \"1\"\n  apiRegion: us-east4\nanf:\n  location: eastus"
        )
        .unwrap();

        let err = load_target(file.path()).unwrap_err();
        assert!(matches!(
            err,
            Error::Install(trident_common::Error::Validation { .. })
        ));
    }
}
