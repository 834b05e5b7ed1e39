//! Manifest assembly pipeline - single entry point for a compilation
//!
//! `compile` resolves a distribution configuration into build options and
//! hands them to `ManifestBuilder::build`, which stages the work directory,
//! runs the overlay engine and addresses the sorted result by content.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{BuildOptions, DistributionConfig};
use crate::error::{Error, Result};
use crate::hashing::{manifest_digest, revision};
use crate::overlay::OverlayEngine;
use crate::registry::{resolve_component_images, ComponentImage, DirImageSource, ImageSource, RegistryVariant, RetryPolicy};
use crate::resources::{parse_yaml_documents, sort_for_apply, to_yaml_stream, Resource};
use crate::staging;
use crate::templates::{SlugOptions, TemplateEngine};
use crate::version::{match_version, version_tag};

/// Upper bound on the time spent looking up component images.
pub const IMAGE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub version: String,
    /// `sha256:<hex>` over `manifest`.
    pub digest: String,
    /// `version@digest`
    pub revision: String,
    pub component_images: Vec<ComponentImage>,
    #[serde(skip)]
    pub objects: Vec<Resource>,
    /// Flattened multi-document stream of `objects` in apply order.
    #[serde(skip)]
    pub manifest: String,
}

pub struct ManifestBuilder {
    engine: TemplateEngine,
    overlay: Box<dyn OverlayEngine>,
}

impl ManifestBuilder {
    pub fn new(overlay: Box<dyn OverlayEngine>) -> Result<Self> {
        let engine = TemplateEngine::new(SlugOptions::default()).map_err(|source| Error::Render {
            template: 0,
            input: None,
            source,
        })?;
        Ok(Self { engine, overlay })
    }

    /// Build the manifests of `source_dir` with `options` inside `work_dir`.
    ///
    /// `work_dir` must be empty; it is left in place for inspection.
    pub fn build(&self, source_dir: &Path, work_dir: &Path, options: &BuildOptions) -> Result<BuildResult> {
        info!(
            version = %options.version,
            namespace = %options.namespace,
            components = options.components.len(),
            "building distribution manifests"
        );

        staging::stage(&self.engine, source_dir, work_dir, options)?;

        let output = self.overlay.build(work_dir)?;
        let text = String::from_utf8(output)
            .map_err(|e| Error::config(format!("overlay output is not UTF-8: {e}")))?;

        let mut objects = parse_yaml_documents(&text)?
            .into_iter()
            .map(Resource::try_from)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::config(format!("overlay output: {e}")))?;
        sort_for_apply(&mut objects);

        let manifest = to_yaml_stream(&objects)?;
        let digest = manifest_digest(manifest.as_bytes());
        let revision = revision(&options.version, &digest);
        debug!(objects = objects.len(), bytes = manifest.len(), "manifests flattened");
        info!(revision = %revision, "distribution built");

        Ok(BuildResult {
            version: options.version.clone(),
            digest,
            revision,
            component_images: options.component_images.clone(),
            objects,
            manifest,
        })
    }
}

/// Release directory of `version` under `data_dir`, named with or without
/// the `v` prefix.
pub fn release_dir(data_dir: &Path, version: &semver::Version) -> Result<PathBuf> {
    [version_tag(version), version.to_string()]
        .into_iter()
        .map(|name| data_dir.join(name))
        .find(|dir| dir.is_dir())
        .ok_or_else(|| Error::VersionNotFound(version.to_string(), data_dir.to_path_buf()))
}

/// Resolve `config` against the releases in `data_dir` and build it.
pub fn compile(
    data_dir: &Path,
    work_dir: &Path,
    config: &DistributionConfig,
    overlay: Box<dyn OverlayEngine>,
) -> Result<BuildResult> {
    let version = match_version(data_dir, &config.version)?;
    let source_dir = release_dir(data_dir, &version)?;
    info!(expr = %config.version, version = %version, "distribution version resolved");

    let mut options = BuildOptions::resolve(config, &version)?;
    let variant = RegistryVariant::resolve(&options.registry, config.variant.as_deref())?;

    let images = DirImageSource::new(data_dir);
    let retry = RetryPolicy::default().with_deadline(Instant::now() + IMAGE_LOOKUP_TIMEOUT);
    options.component_images = lookup_images(&images, &retry, &source_dir, &options, variant)?;

    ManifestBuilder::new(overlay)?.build(&source_dir, work_dir, &options)
}

fn lookup_images(
    source: &dyn ImageSource,
    retry: &RetryPolicy,
    source_dir: &Path,
    options: &BuildOptions,
    variant: RegistryVariant,
) -> Result<Vec<ComponentImage>> {
    let release = source_dir
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| options.version.clone());
    resolve_component_images(source, retry, &release, &options.registry, variant, &options.components)
}
