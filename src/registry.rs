//! Component images - registry variants, versioned image payloads and
//! lookups with bounded retry

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::Component;
use crate::error::{Error, Result};

/// Known registry variants and the registries that host them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegistryVariant {
    UpstreamAlpine,
    EnterpriseAlpine,
    EnterpriseDistroless,
    EnterpriseDistrolessFips,
}

impl RegistryVariant {
    pub const ALL: [RegistryVariant; 4] = [
        RegistryVariant::UpstreamAlpine,
        RegistryVariant::EnterpriseAlpine,
        RegistryVariant::EnterpriseDistroless,
        RegistryVariant::EnterpriseDistrolessFips,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryVariant::UpstreamAlpine => "upstream-alpine",
            RegistryVariant::EnterpriseAlpine => "enterprise-alpine",
            RegistryVariant::EnterpriseDistroless => "enterprise-distroless",
            RegistryVariant::EnterpriseDistrolessFips => "enterprise-distroless-fips",
        }
    }

    pub fn registries(&self) -> &'static [&'static str] {
        match self {
            RegistryVariant::UpstreamAlpine => &["ghcr.io/fluxcd", "docker.io/fluxcd"],
            RegistryVariant::EnterpriseAlpine => &["ghcr.io/controlplaneio-fluxcd/alpine"],
            RegistryVariant::EnterpriseDistroless => &["ghcr.io/controlplaneio-fluxcd/distroless"],
            RegistryVariant::EnterpriseDistrolessFips => {
                &["ghcr.io/controlplaneio-fluxcd/distroless-fips"]
            }
        }
    }

    /// Variant hosted at `registry`, if it is a known one.
    pub fn detect(registry: &str) -> Option<Self> {
        let registry = registry.trim_end_matches('/');
        Self::ALL
            .iter()
            .copied()
            .find(|v| v.registries().contains(&registry))
    }

    /// An explicit variant wins; otherwise the registry must be a known one.
    pub fn resolve(registry: &str, explicit: Option<&str>) -> Result<Self> {
        match explicit {
            Some(name) => name.parse(),
            None => Self::detect(registry).ok_or_else(|| Error::UnknownRegistry(registry.to_string())),
        }
    }
}

impl fmt::Display for RegistryVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegistryVariant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| Error::UnknownRegistryVariant(s.to_string()))
    }
}

/// Versioned image payload: `images: [{name, newTag, digest}]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    #[serde(default)]
    pub images: Vec<PayloadImage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadImage {
    /// Image reference used by the base manifests.
    pub name: String,
    pub new_tag: String,
    #[serde(default)]
    pub digest: Option<String>,
}

impl PayloadImage {
    /// Last path segment of the image name, e.g. `source-controller`.
    pub fn component_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

impl ImagePayload {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

/// Resolved image of one selected component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentImage {
    pub name: String,
    /// Image reference in the base manifests that this image replaces.
    pub source: String,
    pub repository: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ComponentImage {
    pub fn reference(&self) -> String {
        match &self.digest {
            Some(digest) => format!("{}:{}@{}", self.repository, self.tag, digest),
            None => format!("{}:{}", self.repository, self.tag),
        }
    }
}

/// Where image payloads come from.
pub trait ImageSource {
    fn fetch(&self, version: &str, variant: RegistryVariant) -> Result<ImagePayload>;
}

/// Reads `<root>/<version>/images/<variant>.yaml`.
pub struct DirImageSource {
    root: PathBuf,
}

impl DirImageSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn payload_path(&self, version: &str, variant: RegistryVariant) -> PathBuf {
        self.root
            .join(version)
            .join("images")
            .join(format!("{variant}.yaml"))
    }
}

impl ImageSource for DirImageSource {
    fn fetch(&self, version: &str, variant: RegistryVariant) -> Result<ImagePayload> {
        let path = self.payload_path(version, variant);
        let text = fs::read_to_string(&path).map_err(|e| {
            Error::ImageLookup(format!("failed to read {}: {e}", path.display()))
        })?;
        ImagePayload::parse(&text)
    }
}

/// Fixed-backoff retry, bounded by attempts and an optional deadline.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub deadline: Option<Instant>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
            deadline: None,
        }
    }
}

impl RetryPolicy {
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Run `operation` until it succeeds, attempts run out, or the next
    /// attempt would start after the deadline.
    pub fn run<T>(&self, operation_name: &str, mut operation: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match operation() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let past_deadline = self
                .deadline
                .map_or(false, |deadline| Instant::now() + self.backoff >= deadline);
            if attempt >= self.max_attempts.max(1) || past_deadline {
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %err,
                    "operation failed, giving up"
                );
                return Err(err);
            }

            warn!(
                operation = %operation_name,
                attempt = attempt,
                error = %err,
                delay_ms = self.backoff.as_millis() as u64,
                "operation failed, retrying"
            );
            thread::sleep(self.backoff);
        }
    }
}

/// Resolve the image of every selected component from the payload of
/// `version` for `variant`. Repositories are rooted at `registry`.
pub fn resolve_component_images(
    source: &dyn ImageSource,
    retry: &RetryPolicy,
    version: &str,
    registry: &str,
    variant: RegistryVariant,
    components: &[Component],
) -> Result<Vec<ComponentImage>> {
    let payload = retry.run("fetch image payload", || source.fetch(version, variant))?;
    debug!(version, variant = %variant, images = payload.images.len(), "image payload loaded");

    let registry = registry.trim_end_matches('/');
    components
        .iter()
        .map(|component| {
            let image = payload
                .images
                .iter()
                .find(|i| i.component_name() == component.as_str())
                .ok_or_else(|| {
                    Error::ImageLookup(format!(
                        "no {variant} image for {component} in version {version}"
                    ))
                })?;
            Ok(ComponentImage {
                name: component.as_str().to_string(),
                source: image.name.clone(),
                repository: format!("{registry}/{component}"),
                tag: image.new_tag.clone(),
                digest: image.digest.clone(),
            })
        })
        .collect()
}
