//! Image selection
//!
//! Each image comes from the install target when set there, and otherwise
//! from the built-in defaults shipped with this installer.

use trident_common::Error;

use crate::target::InstallTarget;

const STAGING_REGISTRY: &str = "netappdownloads.jfrog.io/oss-docker-trident-staging/astra";
const DEFAULT_TAG: &str = "24.01.0-test.6506551416978f54458c89908e21826027b4570b";

/// Images used when the install target does not name one
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageDefaults {
    /// Trident controller and node image
    pub trident: String,
    /// Autosupport sidecar image
    pub autosupport: String,
    /// trident-operator image
    pub operator: String,
    /// Astra Control Provisioner image
    pub acp: String,
}

impl Default for ImageDefaults {
    fn default() -> Self {
        Self {
            trident: format!("{STAGING_REGISTRY}/trident:{DEFAULT_TAG}"),
            autosupport: "netapp/trident-autosupport:23.10.0".to_string(),
            operator: format!("{STAGING_REGISTRY}/trident-operator:{DEFAULT_TAG}"),
            acp: format!("{STAGING_REGISTRY}/trident-acp:{DEFAULT_TAG}"),
        }
    }
}

/// The images a run deploys, after defaults were applied
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedImages {
    /// Trident image
    pub trident: String,
    /// Autosupport image
    pub autosupport: String,
    /// trident-operator image
    pub operator: String,
    /// Astra Control Provisioner image
    pub acp: String,
}

impl ResolvedImages {
    /// Pick each image from the target, falling back to the defaults.
    ///
    /// An empty string counts as unset. An image that is empty after
    /// defaulting is a validation error.
    pub fn resolve(target: &InstallTarget, defaults: &ImageDefaults) -> Result<Self, Error> {
        Ok(Self {
            trident: pick("Trident", target.trident_image.as_deref(), &defaults.trident)?,
            autosupport: pick(
                "Trident autosupport",
                target.autosupport_image.as_deref(),
                &defaults.autosupport,
            )?,
            operator: pick(
                "Trident operator",
                target.operator_image.as_deref(),
                &defaults.operator,
            )?,
            acp: pick("ACP", target.acp_image.as_deref(), &defaults.acp)?,
        })
    }
}

fn pick(what: &str, requested: Option<&str>, default: &str) -> Result<String, Error> {
    let image = requested.filter(|s| !s.is_empty()).unwrap_or(default);
    if image.is_empty() {
        return Err(Error::validation(format!("no {what} image configured")));
    }
    Ok(image.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_images_take_precedence() {
        let target = InstallTarget {
            trident_image: Some("registry/trident:24.01.0".to_string()),
            operator_image: Some(String::new()),
            ..Default::default()
        };
        let images = ResolvedImages::resolve(&target, &ImageDefaults::default()).unwrap();

        assert_eq!(images.trident, "registry/trident:24.01.0");
        assert_eq!(images.operator, ImageDefaults::default().operator);
        assert_eq!(images.acp, ImageDefaults::default().acp);
    }

    #[test]
    fn default_images_carry_parseable_versions() {
        let defaults = ImageDefaults::default();
        for image in [&defaults.trident, &defaults.operator, &defaults.acp] {
            let version = trident_common::version::version_from_image(image).unwrap();
            assert_eq!(version.to_major_minor().to_string(), "24.01.0");
        }
    }

    #[test]
    fn missing_image_is_a_validation_error() {
        let defaults = ImageDefaults {
            acp: String::new(),
            ..Default::default()
        };
        let err = ResolvedImages::resolve(&InstallTarget::default(), &defaults).unwrap_err();
        assert!(matches!(err, Error::Validation { ref message } if message.contains("ACP")));
    }
}
