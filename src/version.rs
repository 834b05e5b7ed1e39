//! Distribution versions - parsing, matching and range classification

use std::fs;
use std::path::Path;

use semver::{Version, VersionReq};

use crate::error::{Error, Result};

/// Parse a distribution version, accepting an optional `v` prefix.
pub fn parse_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim();
    let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Version::parse(bare).map_err(|source| Error::InvalidVersion {
        raw: raw.to_string(),
        source,
    })
}

/// Canonical tag form of a version, e.g. `v2.7.0`.
pub fn version_tag(version: &Version) -> String {
    format!("v{version}")
}

/// A version expression from the distribution configuration.
///
/// A bare version means exactly that release, anything else is a semver range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionExpr {
    Exact(Version),
    Range(VersionReq),
}

impl VersionExpr {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
        if let Ok(version) = Version::parse(bare) {
            return Ok(Self::Exact(version));
        }
        VersionReq::parse(trimmed)
            .map(Self::Range)
            .map_err(|source| Error::InvalidVersionRange {
                raw: raw.to_string(),
                source,
            })
    }

    pub fn matches(&self, version: &Version) -> bool {
        match self {
            Self::Exact(exact) => exact == version,
            Self::Range(req) => req.matches(version),
        }
    }
}

/// List the releases available under a data directory.
///
/// Every sub-directory whose name parses as a version is a release; anything
/// else is ignored.
pub fn available_versions(data_dir: &Path) -> Result<Vec<Version>> {
    let entries = fs::read_dir(data_dir)
        .map_err(|e| Error::io(format!("failed to read {}", data_dir.display()), e))?;

    let mut versions = vec![];
    for entry in entries {
        let entry = entry.map_err(|e| Error::io("failed to read directory entry", e))?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name();
        if let Ok(version) = parse_version(&name.to_string_lossy()) {
            versions.push(version);
        }
    }
    versions.sort();
    Ok(versions)
}

/// Resolve a version expression to the highest matching release in `data_dir`.
pub fn match_version(data_dir: &Path, expr: &str) -> Result<Version> {
    let parsed = VersionExpr::parse(expr)?;
    available_versions(data_dir)?
        .into_iter()
        .filter(|v| parsed.matches(v))
        .max()
        .ok_or_else(|| Error::VersionNotFound(expr.to_string(), data_dir.to_path_buf()))
}

/// Compare on major.minor.patch only, so a pre-release of a minor belongs to
/// that minor's range.
pub fn at_least(version: &Version, major: u64, minor: u64, patch: u64) -> bool {
    (version.major, version.minor, version.patch) >= (major, minor, patch)
}

/// Workload identity support ladder, resolved once per compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadIdentitySupport {
    /// `< 2.6.0`: no workload identity at all.
    PreWorkloadIdentity,
    /// `2.6.x`: object-level identity behind an opt-in feature gate.
    EarlyWorkloadIdentity,
    /// `>= 2.7.0`: object-level and multi-tenant identity.
    FullWorkloadIdentity,
}

impl WorkloadIdentitySupport {
    pub fn for_version(version: &Version) -> Self {
        if at_least(version, 2, 7, 0) {
            Self::FullWorkloadIdentity
        } else if at_least(version, 2, 6, 0) {
            Self::EarlyWorkloadIdentity
        } else {
            Self::PreWorkloadIdentity
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn data_dir(versions: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for v in versions {
            fs::create_dir(dir.path().join(v)).unwrap();
        }
        fs::write(dir.path().join("README.md"), "not a release").unwrap();
        dir
    }

    #[test]
    fn test_parse_version_prefix() {
        assert_eq!(parse_version("v2.7.0").unwrap(), Version::new(2, 7, 0));
        assert_eq!(parse_version("2.6.4").unwrap(), Version::new(2, 6, 4));
    }

    #[test]
    fn test_parse_version_invalid_is_input_error() {
        let err = parse_version("two.seven").unwrap_err();
        assert!(err.is_input_error());
        assert!(err.to_string().contains("two.seven"));
    }

    #[test]
    fn test_match_exact_version() {
        let dir = data_dir(&["v2.6.4", "v2.7.0", "v2.7.1"]);
        assert_eq!(match_version(dir.path(), "v2.7.0").unwrap(), Version::new(2, 7, 0));
    }

    #[test]
    fn test_match_range_picks_highest() {
        let dir = data_dir(&["v2.5.1", "v2.6.4", "v2.7.0", "v2.7.1"]);
        assert_eq!(match_version(dir.path(), "2.x").unwrap(), Version::new(2, 7, 1));
        assert_eq!(
            match_version(dir.path(), ">=2.5.0, <2.7.0").unwrap(),
            Version::new(2, 6, 4)
        );
    }

    #[test]
    fn test_match_no_release() {
        let dir = data_dir(&["v2.6.4"]);
        let err = match_version(dir.path(), "3.x").unwrap_err();
        assert!(matches!(err, Error::VersionNotFound(..)));
    }

    #[test]
    fn test_match_invalid_range() {
        let dir = data_dir(&["v2.6.4"]);
        let err = match_version(dir.path(), ">>2").unwrap_err();
        assert!(matches!(err, Error::InvalidVersionRange { .. }));
    }

    #[test]
    fn test_support_ladder() {
        let classify = |v: &str| WorkloadIdentitySupport::for_version(&parse_version(v).unwrap());
        assert_eq!(classify("2.5.9"), WorkloadIdentitySupport::PreWorkloadIdentity);
        assert_eq!(classify("2.6.0"), WorkloadIdentitySupport::EarlyWorkloadIdentity);
        assert_eq!(classify("2.6.7"), WorkloadIdentitySupport::EarlyWorkloadIdentity);
        assert_eq!(classify("2.7.0-rc.1"), WorkloadIdentitySupport::FullWorkloadIdentity);
        assert_eq!(classify("2.8.0"), WorkloadIdentitySupport::FullWorkloadIdentity);
    }
}
