//! FluxDistro Core - distribution manifest compiler
//!
//! Compiles a Flux distribution description into a deterministic,
//! content-addressed set of Kubernetes manifests:
//! 1. resolve the version and the features it allows
//! 2. combine input providers into fact-sets
//! 3. render object templates against every fact-set
//! 4. stage, overlay, sort and digest the distribution manifests

pub mod config;
pub mod error;
pub mod features;
pub mod hashing;
pub mod inputs;
pub mod overlay;
pub mod pipeline;
pub mod registry;
pub mod resources;
pub mod staging;
pub mod templates;
pub mod validation;
pub mod version;

pub use config::{load_config, BuildOptions, Component, DistributionConfig};
pub use error::{Error, Result};
pub use features::{PatchSet, WorkloadIdentity};
pub use hashing::{manifest_digest, revision, sha256_hex};
pub use inputs::{combine_providers, Combiner, FactSet, InputProvider, InputStrategy, MAX_PERMUTATIONS};
pub use overlay::{BuiltinOverlay, Kustomize, OverlayEngine, OverlayError};
pub use pipeline::{compile, BuildResult, ManifestBuilder};
pub use registry::{ComponentImage, ImageSource, RegistryVariant};
pub use resources::{Resource, ResourceSet};
pub use templates::{SlugOptions, TemplateEngine, TemplateError};
pub use validation::{ValidationRule, ValidationViolation, Validator, ViolationKind};
pub use version::{match_version, parse_version, WorkloadIdentitySupport};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
