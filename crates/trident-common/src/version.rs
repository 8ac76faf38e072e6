//! Version parsing for container image tags
//!
//! Trident images are tagged with date-based versions (`24.01.0`,
//! `24.01.0-test.6506551`), while Kubernetes and most other components
//! use semantic versions (`v1.28.3+k3s1`). Both parse into the same
//! [`Version`] type and order the same way, so compatibility gates can
//! compare them directly.

use std::cmp::Ordering;
use std::fmt;

use crate::Error;

/// How a [`Version`] was written
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionFormat {
    /// `YY.MM[.P]`, zero-padded year and month
    Date,
    /// `[v]MAJOR.MINOR.PATCH`
    Semantic,
}

/// A parsed version with optional pre-release and build metadata.
///
/// Ordering follows semantic versioning precedence: numeric components
/// first, then a pre-release sorts before the release it precedes. Build
/// metadata and the original format never affect ordering or equality.
#[derive(Clone, Debug)]
pub struct Version {
    major: u64,
    minor: u64,
    patch: u64,
    pre_release: Vec<String>,
    build: Option<String>,
    format: VersionFormat,
}

impl Version {
    /// Parse a date-based version such as `21.01.0` or `24.01.0-test.abc`
    pub fn parse_date(input: &str) -> Result<Self, Error> {
        let (core, pre_release, build) = split_metadata(input)?;
        let parts: Vec<&str> = core.split('.').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(invalid(input, "expected YY.MM or YY.MM.P"));
        }
        if parts[0].len() != 2 || parts[1].len() != 2 {
            return Err(invalid(input, "year and month must be two digits"));
        }
        let major = parse_number(input, parts[0])?;
        let minor = parse_number(input, parts[1])?;
        if !(1..=12).contains(&minor) {
            return Err(invalid(input, "month must be between 01 and 12"));
        }
        let patch = match parts.get(2) {
            Some(p) => parse_number(input, p)?,
            None => 0,
        };
        Ok(Self {
            major,
            minor,
            patch,
            pre_release,
            build,
            format: VersionFormat::Date,
        })
    }

    /// Parse a semantic version such as `1.2.3` or `v1.28.3-rc.1+k3s1`
    pub fn parse_semantic(input: &str) -> Result<Self, Error> {
        let trimmed = input.strip_prefix('v').unwrap_or(input);
        let (core, pre_release, build) = split_metadata(trimmed)?;
        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() != 3 {
            return Err(invalid(input, "expected MAJOR.MINOR.PATCH"));
        }
        Ok(Self {
            major: parse_number(input, parts[0])?,
            minor: parse_number(input, parts[1])?,
            patch: parse_number(input, parts[2])?,
            pre_release,
            build,
            format: VersionFormat::Semantic,
        })
    }

    /// Parse either format, trying the date format first
    pub fn parse(input: &str) -> Result<Self, Error> {
        Self::parse_date(input).or_else(|_| Self::parse_semantic(input))
    }

    /// Major component (the year for date versions)
    pub fn major(&self) -> u64 {
        self.major
    }

    /// Minor component (the month for date versions)
    pub fn minor(&self) -> u64 {
        self.minor
    }

    /// Patch component
    pub fn patch(&self) -> u64 {
        self.patch
    }

    /// Pre-release identifiers, empty for a release
    pub fn pre_release(&self) -> &[String] {
        &self.pre_release
    }

    /// Format the version was parsed from
    pub fn format(&self) -> VersionFormat {
        self.format
    }

    /// The same version truncated to major.minor
    pub fn to_major_minor(&self) -> Self {
        Self {
            major: self.major,
            minor: self.minor,
            patch: 0,
            pre_release: Vec::new(),
            build: None,
            format: self.format,
        }
    }

    /// Check if this version sorts strictly before `other`
    pub fn less_than(&self, other: &Version) -> bool {
        self < other
    }

    /// Fail with [`Error::VersionIncompatible`] when this version's
    /// major.minor is older than `minimum`
    pub fn ensure_at_least(&self, minimum: &Version) -> Result<(), Error> {
        if self.to_major_minor().less_than(minimum) {
            return Err(Error::VersionIncompatible {
                version: self.to_string(),
                minimum: minimum.to_string(),
            });
        }
        Ok(())
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| compare_pre_release(&self.pre_release, &other.pre_release))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format {
            VersionFormat::Date => write!(f, "{:02}.{:02}.{}", self.major, self.minor, self.patch)?,
            VersionFormat::Semantic => write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?,
        }
        if !self.pre_release.is_empty() {
            write!(f, "-{}", self.pre_release.join("."))?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{}", build)?;
        }
        Ok(())
    }
}

/// Split an image reference into its registry domain and the remainder.
///
/// The first path component is a domain only when it contains a `.` or a
/// `:` or is `localhost`, the same rule container runtimes apply. The
/// domain may carry a port, so its colon must not be mistaken for a tag.
pub fn split_image_domain(image: &str) -> (Option<&str>, &str) {
    match image.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (Some(first), rest)
        }
        _ => (None, image),
    }
}

/// Extract the version from an image reference's tag.
///
/// `registry.example.com:5000/trident:24.01.0` yields `24.01.0`. Digests
/// are ignored; an image without a tag has no version.
pub fn version_from_image(image: &str) -> Result<Version, Error> {
    let (_, remainder) = split_image_domain(image);
    let without_digest = remainder.split('@').next().unwrap_or(remainder);
    match without_digest.rsplit_once(':') {
        Some((_, tag)) if !tag.is_empty() => Version::parse(tag),
        _ => Err(invalid(image, "cannot get version from image without a tag")),
    }
}

fn split_metadata(input: &str) -> Result<(&str, Vec<String>, Option<String>), Error> {
    let (rest, build) = match input.split_once('+') {
        Some((rest, build)) if !build.is_empty() => (rest, Some(build.to_string())),
        Some(_) => return Err(invalid(input, "empty build metadata")),
        None => (input, None),
    };
    let (core, pre_release) = match rest.split_once('-') {
        Some((core, pre)) => {
            let ids: Vec<String> = pre.split('.').map(str::to_string).collect();
            if ids.iter().any(String::is_empty) {
                return Err(invalid(input, "empty pre-release identifier"));
            }
            (core, ids)
        }
        None => (rest, Vec::new()),
    };
    Ok((core, pre_release, build))
}

fn parse_number(input: &str, part: &str) -> Result<u64, Error> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(input, format!("{part:?} is not a number")));
    }
    part.parse()
        .map_err(|e| invalid(input, format!("{part:?}: {e}")))
}

fn compare_pre_release(a: &[String], b: &[String]) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        (false, false) => {}
    }
    for (x, y) in a.iter().zip(b) {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(nx), Ok(ny)) => nx.cmp(&ny),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn invalid(input: &str, message: impl Into<String>) -> Error {
    Error::InvalidVersion {
        input: input.to_string(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_date_versions() {
        let v = Version::parse_date("21.01.0").unwrap();
        assert_eq!((v.major(), v.minor(), v.patch()), (21, 1, 0));
        assert_eq!(v.to_string(), "21.01.0");

        let v = Version::parse_date("24.01").unwrap();
        assert_eq!(v.patch(), 0);

        let v = Version::parse_date("24.01.0-test.6506551416978f54").unwrap();
        assert_eq!(v.pre_release(), ["test", "6506551416978f54"]);
        assert_eq!(v.format(), VersionFormat::Date);
    }

    #[test]
    fn rejects_malformed_date_versions() {
        assert!(Version::parse_date("2024.01.0").is_err());
        assert!(Version::parse_date("24.13.0").is_err());
        assert!(Version::parse_date("24.1.0").is_err());
        assert!(Version::parse_date("latest").is_err());
        assert!(Version::parse_date("24.01.0-").is_err());
    }

    #[test]
    fn parses_semantic_versions() {
        let v = Version::parse_semantic("v1.28.3+k3s1").unwrap();
        assert_eq!((v.major(), v.minor(), v.patch()), (1, 28, 3));
        assert_eq!(v.to_string(), "1.28.3+k3s1");
        assert!(Version::parse_semantic("1.28").is_err());
    }

    #[test]
    fn date_and_semantic_agree_on_ordering() {
        let date_old = Version::parse_date("20.04.0").unwrap();
        let date_new = Version::parse_date("21.01.0").unwrap();
        let sem_old = Version::parse_semantic("20.4.0").unwrap();
        let sem_new = Version::parse_semantic("21.1.0").unwrap();

        assert!(date_old.less_than(&date_new));
        assert!(sem_old.less_than(&sem_new));
        assert_eq!(date_old, sem_old);
        assert!(date_old.less_than(&sem_new));
    }

    #[test]
    fn pre_release_sorts_before_release() {
        let pre = Version::parse("24.01.0-test.1").unwrap();
        let rel = Version::parse("24.01.0").unwrap();
        assert!(pre.less_than(&rel));
        assert!(!rel.less_than(&pre));

        let a = Version::parse("1.0.0-alpha.2").unwrap();
        let b = Version::parse("1.0.0-alpha.10").unwrap();
        assert!(a.less_than(&b));
    }

    #[test]
    fn minimum_version_gate_uses_major_minor() {
        let floor = Version::parse_date("21.01.0").unwrap();

        let too_old = Version::parse_date("20.04.0").unwrap();
        match too_old.ensure_at_least(&floor) {
            Err(Error::VersionIncompatible { version, minimum }) => {
                assert_eq!(version, "20.04.0");
                assert_eq!(minimum, "21.01.0");
            }
            other => panic!("expected VersionIncompatible, got {other:?}"),
        }

        // A pre-release of the floor release still passes the major.minor gate
        let pre_floor = Version::parse_date("21.01.0-rc.1").unwrap();
        assert!(pre_floor.ensure_at_least(&floor).is_ok());
        assert!(Version::parse_date("24.01.0")
            .unwrap()
            .ensure_at_least(&floor)
            .is_ok());
    }

    #[test]
    fn splits_image_domains() {
        assert_eq!(
            split_image_domain("registry:5000/trident:24.01.0"),
            (Some("registry:5000"), "trident:24.01.0")
        );
        assert_eq!(
            split_image_domain("netapp/trident:24.01.0"),
            (None, "netapp/trident:24.01.0")
        );
        assert_eq!(
            split_image_domain("localhost/trident:24.01.0"),
            (Some("localhost"), "trident:24.01.0")
        );
    }

    #[test]
    fn extracts_version_from_image() {
        let v = version_from_image("registry/trident:24.01.0").unwrap();
        assert_eq!(v.to_string(), "24.01.0");

        let v = version_from_image("registry.example.com:5000/astra/trident-operator:23.10.1").unwrap();
        assert_eq!(v.to_string(), "23.10.1");

        let v = version_from_image("docker.io/netapp/trident:v1.2.3@sha256:abcd").unwrap();
        assert_eq!(v.format(), VersionFormat::Semantic);

        assert!(version_from_image("registry.example.com:5000/trident").is_err());
        assert!(version_from_image("trident:latest").is_err());
    }
}
