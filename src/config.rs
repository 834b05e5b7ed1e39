//! Distribution configuration - what the user asks for
//!
//! `DistributionConfig` is the serialized input. `BuildOptions` is the fully
//! resolved form the pipeline consumes: exact version, validated components,
//! accumulated patches and image overrides.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::features::{self, PatchSet, WorkloadIdentity};
use crate::overlay::PatchEntry;
use crate::registry::ComponentImage;
use crate::validation::Validator;
use crate::version::{at_least, version_tag};

pub const DEFAULT_NAMESPACE: &str = "flux-system";
pub const DEFAULT_REGISTRY: &str = "ghcr.io/fluxcd";
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// The fixed catalog of controller components, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    SourceController,
    KustomizeController,
    HelmController,
    NotificationController,
    ImageReflectorController,
    ImageAutomationController,
    SourceWatcher,
}

impl Component {
    pub const ALL: [Component; 7] = [
        Component::SourceController,
        Component::KustomizeController,
        Component::HelmController,
        Component::NotificationController,
        Component::ImageReflectorController,
        Component::ImageAutomationController,
        Component::SourceWatcher,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::SourceController => "source-controller",
            Component::KustomizeController => "kustomize-controller",
            Component::HelmController => "helm-controller",
            Component::NotificationController => "notification-controller",
            Component::ImageReflectorController => "image-reflector-controller",
            Component::ImageAutomationController => "image-automation-controller",
            Component::SourceWatcher => "source-watcher",
        }
    }

    /// First release that ships this component's API.
    pub fn min_version(&self) -> Option<Version> {
        match self {
            Component::SourceWatcher => Some(Version::new(2, 7, 0)),
            _ => None,
        }
    }

    pub fn available_in(&self, version: &Version) -> bool {
        self.min_version()
            .map_or(true, |min| at_least(version, min.major, min.minor, min.patch))
    }

    /// Manifest file of this component inside a versioned source tree.
    pub fn manifest_file(&self) -> String {
        format!("{}.yaml", self.as_str())
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Component {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Component::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::UnknownComponent(s.to_string()))
    }
}

/// Cluster distribution profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterProfile {
    #[default]
    Kubernetes,
    Openshift,
    Aws,
    Azure,
    Gcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    #[serde(default, rename = "type")]
    pub profile: ClusterProfile,
    #[serde(default)]
    pub multitenant: bool,
    #[serde(default)]
    pub tenant_default_service_account: Option<String>,
    #[serde(default = "default_cluster_domain")]
    pub domain: String,
}

impl Default for Cluster {
    fn default() -> Self {
        Self {
            profile: ClusterProfile::default(),
            multitenant: false,
            tenant_default_service_account: None,
            domain: default_cluster_domain(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sharding {
    #[serde(default = "default_sharding_key")]
    pub key: String,
    pub shards: Vec<String>,
}

/// Persistent storage for source-controller artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Storage {
    pub class: String,
    pub size: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncKind {
    GitRepository,
    OCIRepository,
    Bucket,
}

impl SyncKind {
    pub fn api_version(&self) -> &'static str {
        match self {
            SyncKind::GitRepository | SyncKind::Bucket => "source.toolkit.fluxcd.io/v1",
            SyncKind::OCIRepository => "source.toolkit.fluxcd.io/v1beta2",
        }
    }
}

/// Cluster sync source the distribution reconciles from after bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSpec {
    pub kind: SyncKind,
    pub url: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub path: String,
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default)]
    pub pull_secret: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// User-facing distribution description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_registry")]
    pub registry: String,
    /// Registry variant, required when the registry is not a known one.
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub image_pull_secret: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_components")]
    pub components: Vec<String>,
    #[serde(default)]
    pub cluster: Cluster,
    #[serde(default)]
    pub workload_identity: WorkloadIdentity,
    #[serde(default)]
    pub sharding: Option<Sharding>,
    #[serde(default)]
    pub storage: Option<Storage>,
    #[serde(default)]
    pub sync: Option<SyncSpec>,
    #[serde(default = "default_node_selector")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub toleration_keys: Vec<String>,
    /// Custom overlay patches, appended after the generated ones.
    #[serde(default)]
    pub patches: Vec<PatchEntry>,
}

fn default_version() -> String { "2.x".to_string() }
fn default_registry() -> String { DEFAULT_REGISTRY.to_string() }
fn default_namespace() -> String { DEFAULT_NAMESPACE.to_string() }
fn default_cluster_domain() -> String { DEFAULT_CLUSTER_DOMAIN.to_string() }
fn default_sharding_key() -> String { "sharding.fluxcd.io/key".to_string() }
fn default_interval() -> String { "1m".to_string() }

fn default_components() -> Vec<String> {
    [
        Component::SourceController,
        Component::KustomizeController,
        Component::HelmController,
        Component::NotificationController,
    ]
    .iter()
    .map(|c| c.as_str().to_string())
    .collect()
}

fn default_node_selector() -> BTreeMap<String, String> {
    BTreeMap::from([("kubernetes.io/os".to_string(), "linux".to_string())])
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            registry: default_registry(),
            variant: None,
            image_pull_secret: None,
            namespace: default_namespace(),
            components: default_components(),
            cluster: Cluster::default(),
            workload_identity: WorkloadIdentity::default(),
            sharding: None,
            storage: None,
            sync: None,
            node_selector: default_node_selector(),
            toleration_keys: vec![],
            patches: vec![],
        }
    }
}

/// Load a configuration file; `.json` files are read as JSON, anything else as YAML.
pub fn load_config(path: &Path) -> Result<DistributionConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::io(format!("failed to read config {}", path.display()), e))?;
    if path.extension().map_or(false, |e| e == "json") {
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_yaml::from_str(&content)?)
    }
}

/// Resolved inputs of a single build. Mutated only while being resolved.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Exact release tag, e.g. `v2.7.0`.
    pub version: String,
    pub namespace: String,
    pub components: Vec<Component>,
    pub component_images: Vec<ComponentImage>,
    pub registry: String,
    pub image_pull_secret: Option<String>,
    pub node_selector: BTreeMap<String, String>,
    pub toleration_keys: Vec<String>,
    pub storage: Option<Storage>,
    pub sync: Option<SyncSpec>,
    pub sharding: Option<Sharding>,
    pub patches: PatchSet,
    /// Drop the `serviceaccounts/token` create grant from the base RBAC.
    pub remove_token_permission: bool,
}

impl BuildOptions {
    /// Options with no optional features for an exact version.
    pub fn new(version: &Version, components: Vec<Component>) -> Self {
        Self {
            version: version_tag(version),
            namespace: default_namespace(),
            components,
            component_images: vec![],
            registry: default_registry(),
            image_pull_secret: None,
            node_selector: default_node_selector(),
            toleration_keys: vec![],
            storage: None,
            sync: None,
            sharding: None,
            patches: PatchSet::new(),
            remove_token_permission: false,
        }
    }

    /// Validate `config` against the resolved `version` and apply every
    /// feature resolver.
    pub fn resolve(config: &DistributionConfig, version: &Version) -> Result<Self> {
        Validator::new().check(config, version)?;
        let mut components = config
            .components
            .iter()
            .map(|c| c.parse::<Component>())
            .collect::<Result<Vec<_>>>()?;
        components.sort();
        components.dedup();

        let mut options = Self::new(version, components);
        options.namespace = config.namespace.clone();
        options.registry = config.registry.trim_end_matches('/').to_string();
        options.image_pull_secret = config.image_pull_secret.clone();
        options.node_selector = config.node_selector.clone();
        options.toleration_keys = config.toleration_keys.clone();
        options.storage = config.storage.clone();
        options.sync = config.sync.clone();
        options.sharding = config.sharding.clone();

        features::apply_workload_identity(&mut options, version, &config.workload_identity)?;
        features::apply_cluster_profile(&mut options, &config.cluster)?;
        if let Some(sharding) = &config.sharding {
            features::apply_sharding(&mut options, version, sharding)?;
        }
        if !config.patches.is_empty() {
            options.patches.push(serde_yaml::to_string(&config.patches)?);
        }

        Ok(options)
    }

    pub fn has_component(&self, component: Component) -> bool {
        self.components.contains(&component)
    }
}
