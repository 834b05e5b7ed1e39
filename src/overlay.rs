//! Structural overlay engines
//!
//! An overlay engine takes a staged directory holding a `kustomization.yaml`
//! and produces the flattened multi-document YAML stream of every object it
//! describes, with patches and transformers applied.
//!
//! Two engines are provided:
//! - [`Kustomize`] runs the external `kustomize build` binary
//! - [`BuiltinOverlay`] builds the descriptor subset the pipeline stages
//!   (resources, namespace, nameSuffix, images, label/annotation transformers,
//!   JSON6902 and strategic-merge patches) without leaving the process

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::resources::parse_yaml_documents;

pub const KUSTOMIZATION_FILE: &str = "kustomization.yaml";
const KUSTOMIZATION_FILES: [&str; 3] = [KUSTOMIZATION_FILE, "kustomization.yml", "Kustomization"];

const MAX_NESTING: usize = 16;

/// Operations a JSON6902 patch may use.
const JSON6902_OPS: [&str; 6] = ["add", "remove", "replace", "move", "copy", "test"];

/// Kinds the namespace transformer leaves alone.
const CLUSTER_SCOPED_KINDS: [&str; 11] = [
    "Namespace",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "PriorityClass",
    "StorageClass",
    "PersistentVolume",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
    "APIService",
    "IngressClass",
];

#[derive(Debug, Error)]
pub enum OverlayError {
    /// The external engine failed; its stderr is kept verbatim.
    #[error("{0}")]
    Build(String),

    #[error("Unexpected kind: {0}")]
    UnexpectedOp(String),

    #[error("failed to execute {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("{}: {message}", .path.display())]
    Descriptor { path: PathBuf, message: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{}: {source}", .path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to patch {object}: {source}")]
    Patch {
        object: String,
        #[source]
        source: json_patch::PatchError,
    },

    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    #[error("invalid target name '{pattern}': {source}")]
    InvalidSelector {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

fn descriptor(path: &Path, message: impl Into<String>) -> OverlayError {
    OverlayError::Descriptor {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

/// Turns a staged directory into a flattened manifest stream.
pub trait OverlayEngine {
    fn build(&self, dir: &Path) -> Result<Vec<u8>, OverlayError>;
}

/// Object selector of a patch entry. Unset fields match everything; `name`
/// is an anchored regular expression.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_selector: Option<String>,
}

/// One item of a kustomization `patches:` list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
}

/// Image rewrite of a kustomization `images:` list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageOverride {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// The `kustomization.yaml` fields understood by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kustomization {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_suffix: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transformers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageOverride>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<PatchEntry>,
}

fn default_api_version() -> String { "kustomize.config.k8s.io/v1beta1".to_string() }
fn default_kind() -> String { "Kustomization".to_string() }

impl Kustomization {
    pub fn new() -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            namespace: None,
            name_suffix: None,
            resources: vec![],
            transformers: vec![],
            images: vec![],
            patches: vec![],
        }
    }
}

impl Default for Kustomization {
    fn default() -> Self {
        Self::new()
    }
}

// --- external engine ---

/// Runs `kustomize build` on the staged directory.
pub struct Kustomize {
    binary: PathBuf,
}

impl Kustomize {
    pub fn new() -> Self {
        Self::with_binary("kustomize")
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Default for Kustomize {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlayEngine for Kustomize {
    fn build(&self, dir: &Path) -> Result<Vec<u8>, OverlayError> {
        info!(dir = %dir.display(), binary = %self.binary.display(), "running kustomize build");

        // shard overlays reference manifests above their own directory
        let output = Command::new(&self.binary)
            .arg("build")
            .arg(dir)
            .arg("--load-restrictor=LoadRestrictionsNone")
            .output()
            .map_err(|source| OverlayError::Spawn {
                binary: self.binary.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(dir = %dir.display(), stderr = %stderr, "kustomize build failed");
            return Err(OverlayError::Build(stderr));
        }

        debug!(bytes = output.stdout.len(), "kustomize build succeeded");
        Ok(output.stdout)
    }
}

// --- in-process engine ---

/// In-process engine for the descriptor subset the pipeline generates.
///
/// Order within one directory: resources, patches, namespace, nameSuffix,
/// images, transformers. Nested directories are built first and then
/// transformed by their parent.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinOverlay;

impl OverlayEngine for BuiltinOverlay {
    fn build(&self, dir: &Path) -> Result<Vec<u8>, OverlayError> {
        debug!(dir = %dir.display(), "building overlay in-process");
        let objects = build_dir(dir, 0)?;

        let mut out = String::new();
        for (i, object) in objects.iter().enumerate() {
            if i > 0 {
                out.push_str("---\n");
            }
            let text = serde_yaml::to_string(object).map_err(|source| OverlayError::Yaml {
                path: dir.to_path_buf(),
                source,
            })?;
            out.push_str(&text);
        }
        debug!(objects = objects.len(), "overlay built");
        Ok(out.into_bytes())
    }
}

fn load_kustomization(dir: &Path) -> Result<(PathBuf, Kustomization), OverlayError> {
    let Some(path) = KUSTOMIZATION_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
    else {
        return Err(descriptor(dir, "no kustomization file found"));
    };
    let content = fs::read_to_string(&path).map_err(|source| OverlayError::Io {
        context: format!("failed to read {}", path.display()),
        source,
    })?;
    let kustomization = serde_yaml::from_str(&content).map_err(|source| OverlayError::Yaml {
        path: path.clone(),
        source,
    })?;
    Ok((path, kustomization))
}

fn read_documents(path: &Path) -> Result<Vec<Value>, OverlayError> {
    let content = fs::read_to_string(path).map_err(|source| OverlayError::Io {
        context: format!("failed to read {}", path.display()),
        source,
    })?;
    parse_yaml_documents(&content).map_err(|source| OverlayError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

fn build_dir(dir: &Path, depth: usize) -> Result<Vec<Value>, OverlayError> {
    if depth > MAX_NESTING {
        return Err(descriptor(dir, format!("kustomizations nested deeper than {MAX_NESTING}")));
    }
    let (file, kustomization) = load_kustomization(dir)?;

    let mut objects = vec![];
    for entry in &kustomization.resources {
        let path = dir.join(entry);
        if path.is_dir() {
            objects.extend(build_dir(&path, depth + 1)?);
        } else if path.is_file() {
            objects.extend(read_documents(&path)?);
        } else {
            return Err(descriptor(&file, format!("resource '{entry}' not found")));
        }
    }

    for entry in &kustomization.patches {
        apply_patch_entry(dir, &file, entry, &mut objects)?;
    }

    if let Some(namespace) = &kustomization.namespace {
        for object in objects.iter_mut().filter(|o| !is_cluster_scoped(o)) {
            set_metadata(object, "namespace", namespace);
        }
    }

    if let Some(suffix) = &kustomization.name_suffix {
        for object in &mut objects {
            if matches!(kind_of(object), "CustomResourceDefinition" | "Namespace") {
                continue;
            }
            let name = format!("{}{suffix}", name_of(object));
            set_metadata(object, "name", &name);
        }
    }

    if !kustomization.images.is_empty() {
        for object in &mut objects {
            rewrite_images(object, &kustomization.images);
        }
    }

    for entry in &kustomization.transformers {
        let path = dir.join(entry);
        for document in read_documents(&path)? {
            let transformer: MetadataTransformer = serde_json::from_value(document)
                .map_err(|source| OverlayError::Decode { path: path.clone(), source })?;
            transformer.apply(&path, &mut objects)?;
        }
    }

    Ok(objects)
}

// --- patches ---

fn apply_patch_entry(
    dir: &Path,
    file: &Path,
    entry: &PatchEntry,
    objects: &mut Vec<Value>,
) -> Result<(), OverlayError> {
    let (body, origin) = match (&entry.patch, &entry.path) {
        (Some(inline), _) => (inline.clone(), file.to_path_buf()),
        (None, Some(relative)) => {
            let path = dir.join(relative);
            let body = fs::read_to_string(&path).map_err(|source| OverlayError::Io {
                context: format!("failed to read patch {}", path.display()),
                source,
            })?;
            (body, path)
        }
        (None, None) => return Err(descriptor(file, "patch entry needs either 'patch' or 'path'")),
    };

    let documents = parse_yaml_documents(&body)
        .map_err(|source| OverlayError::Yaml { path: origin, source })?;
    for document in documents {
        match document {
            Value::Array(operations) => {
                let Some(target) = &entry.target else {
                    return Err(OverlayError::InvalidPatch(
                        "a JSON6902 patch requires a target".to_string(),
                    ));
                };
                apply_json6902(operations, target, objects)?;
            }
            Value::Object(_) => apply_strategic_merge(&document, entry.target.as_ref(), objects)?,
            other => {
                return Err(OverlayError::InvalidPatch(format!(
                    "expected a list of operations or an object, got {other}"
                )))
            }
        }
    }
    Ok(())
}

/// Check every `op` before decoding so a malformed operation is reported by name.
fn parse_operations(operations: Vec<Value>) -> Result<Vec<json_patch::PatchOperation>, OverlayError> {
    for operation in &operations {
        let op = operation.get("op").and_then(Value::as_str).unwrap_or_default();
        if !JSON6902_OPS.contains(&op) {
            return Err(OverlayError::UnexpectedOp(op.to_string()));
        }
    }
    serde_json::from_value(Value::Array(operations))
        .map_err(|e| OverlayError::InvalidPatch(e.to_string()))
}

fn apply_json6902(
    operations: Vec<Value>,
    target: &Target,
    objects: &mut [Value],
) -> Result<(), OverlayError> {
    let operations = parse_operations(operations)?;
    let selector = Selector::compile(target)?;
    for object in objects.iter_mut().filter(|o| selector.matches(o)) {
        json_patch::patch(object, &operations).map_err(|source| OverlayError::Patch {
            object: describe(object),
            source,
        })?;
    }
    Ok(())
}

fn apply_strategic_merge(
    patch: &Value,
    target: Option<&Target>,
    objects: &mut Vec<Value>,
) -> Result<(), OverlayError> {
    let delete = patch.get("$patch").and_then(Value::as_str) == Some("delete");
    let selector = target.map(Selector::compile).transpose()?;

    let mut body = patch.clone();
    if selector.is_some() {
        // a targeted patch keeps the identity of whatever it matches
        if let Some(map) = body.as_object_mut() {
            map.remove("apiVersion");
            map.remove("kind");
        }
        if let Some(metadata) = body.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.remove("name");
            metadata.remove("namespace");
        }
    }

    let mut matched = 0usize;
    let mut kept = Vec::with_capacity(objects.len());
    for mut object in objects.drain(..) {
        let hit = match &selector {
            Some(selector) => selector.matches(&object),
            None => same_identity(&object, patch),
        };
        if !hit {
            kept.push(object);
            continue;
        }
        matched += 1;
        if !delete {
            merge(&mut object, &body);
            kept.push(object);
        }
    }
    *objects = kept;

    if matched == 0 && selector.is_none() {
        return Err(OverlayError::InvalidPatch(format!(
            "no object matches patch for {}",
            describe(patch)
        )));
    }
    Ok(())
}

fn same_identity(object: &Value, patch: &Value) -> bool {
    if kind_of(object) != kind_of(patch) || name_of(object) != name_of(patch) {
        return false;
    }
    match patch.pointer("/metadata/namespace").and_then(Value::as_str) {
        Some(ns) => object.pointer("/metadata/namespace").and_then(Value::as_str) == Some(ns),
        None => true,
    }
}

/// Strategic merge: maps merge recursively, `null` deletes a key, lists of
/// named maps merge by `name` and honor `$patch: delete`, other lists are
/// replaced.
fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                if key == "$patch" {
                    continue;
                }
                if value.is_null() {
                    target.remove(key);
                    continue;
                }
                match target.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        if let Some(value) = without_deletes(value) {
                            target.insert(key.clone(), value);
                        }
                    }
                }
            }
        }
        (Value::Array(target), Value::Array(patch)) if is_named_list(target) && is_named_list(patch) => {
            for item in patch {
                let name = item.get("name").cloned();
                let position = target.iter().position(|t| t.get("name").cloned() == name);
                let delete = item.get("$patch").and_then(Value::as_str) == Some("delete");
                match (position, delete) {
                    (Some(i), true) => {
                        target.remove(i);
                    }
                    (Some(i), false) => merge(&mut target[i], item),
                    (None, true) => {}
                    (None, false) => target.extend(without_deletes(item)),
                }
            }
        }
        (target, patch) => *target = strip_directives(patch),
    }
}

fn is_named_list(items: &[Value]) -> bool {
    !items.is_empty() && items.iter().all(|i| i.get("name").map_or(false, Value::is_string))
}

/// Patch content for a key the target lacks. Deletions have nothing to act
/// on there; `None` when only deletions are left.
fn without_deletes(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let kept: Map<String, Value> = map
                .iter()
                .filter(|(k, _)| k.as_str() != "$patch")
                .filter_map(|(k, v)| without_deletes(v).map(|v| (k.clone(), v)))
                .collect();
            if kept.is_empty() && !map.is_empty() {
                None
            } else {
                Some(Value::Object(kept))
            }
        }
        Value::Array(items) => Some(Value::Array(items.iter().filter_map(without_deletes).collect())),
        other => Some(other.clone()),
    }
}

fn strip_directives(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| k.as_str() != "$patch")
                .map(|(k, v)| (k.clone(), strip_directives(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_directives).collect()),
        other => other.clone(),
    }
}

struct Selector<'a> {
    target: &'a Target,
    name: Option<Regex>,
}

impl<'a> Selector<'a> {
    fn compile(target: &'a Target) -> Result<Self, OverlayError> {
        let name = match &target.name {
            Some(pattern) => Some(Regex::new(&format!("^(?:{pattern})$")).map_err(|source| {
                OverlayError::InvalidSelector {
                    pattern: pattern.clone(),
                    source,
                }
            })?),
            None => None,
        };
        Ok(Self { target, name })
    }

    fn matches(&self, object: &Value) -> bool {
        let api_version = object.get("apiVersion").and_then(Value::as_str).unwrap_or_default();
        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };
        let target = self.target;
        target.group.as_deref().map_or(true, |g| g == group)
            && target.version.as_deref().map_or(true, |v| v == version)
            && target.kind.as_deref().map_or(true, |k| k == kind_of(object))
            && self.name.as_ref().map_or(true, |re| re.is_match(name_of(object)))
            && target.namespace.as_deref().map_or(true, |ns| {
                object.pointer("/metadata/namespace").and_then(Value::as_str) == Some(ns)
            })
            && target.label_selector.as_deref().map_or(true, |s| {
                selector_matches(s, object.pointer("/metadata/labels"))
            })
            && target.annotation_selector.as_deref().map_or(true, |s| {
                selector_matches(s, object.pointer("/metadata/annotations"))
            })
    }
}

/// Equality-based selector: `k=v`, `k==v`, `k!=v`, `k` and `!k`, comma separated.
fn selector_matches(selector: &str, values: Option<&Value>) -> bool {
    let get = |key: &str| values.and_then(|v| v.get(key.trim())).and_then(Value::as_str);
    selector
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .all(|requirement| {
            if let Some((key, value)) = requirement.split_once("!=") {
                get(key) != Some(value.trim())
            } else if let Some((key, value)) = requirement.split_once('=') {
                let value = value.strip_prefix('=').unwrap_or(value);
                get(key) == Some(value.trim())
            } else if let Some(key) = requirement.strip_prefix('!') {
                get(key).is_none()
            } else {
                get(requirement).is_some()
            }
        })
}

// --- images ---

fn rewrite_images(value: &mut Value, images: &[ImageOverride]) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if key == "containers" || key == "initContainers" {
                    if let Value::Array(containers) = child {
                        for container in containers {
                            if let Some(Value::String(image)) = container.get_mut("image") {
                                if let Some(rewritten) = rewrite_image(image, images) {
                                    *image = rewritten;
                                }
                            }
                        }
                    }
                } else {
                    rewrite_images(child, images);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_images(item, images);
            }
        }
        _ => {}
    }
}

fn rewrite_image(reference: &str, images: &[ImageOverride]) -> Option<String> {
    let (name, tag, digest) = split_image(reference);
    let image = images.iter().find(|i| i.name == name)?;

    let mut out = image.new_name.clone().unwrap_or_else(|| name.to_string());
    let tag = image
        .new_tag
        .as_deref()
        .or(if image.digest.is_some() { None } else { tag });
    if let Some(tag) = tag {
        out.push(':');
        out.push_str(tag);
    }
    if let Some(digest) = image.digest.as_deref().or(digest) {
        out.push('@');
        out.push_str(digest);
    }
    Some(out)
}

/// Split `repo[:tag][@digest]`; a `:` before the last `/` is a registry port.
pub fn split_image(reference: &str) -> (&str, Option<&str>, Option<&str>) {
    let (rest, digest) = match reference.split_once('@') {
        Some((rest, digest)) => (rest, Some(digest)),
        None => (reference, None),
    };
    match rest.rfind(':') {
        Some(i) if !rest[i..].contains('/') => (&rest[..i], Some(&rest[i + 1..]), digest),
        _ => (rest, None, digest),
    }
}

// --- transformers ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataTransformer {
    kind: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
    #[serde(default)]
    field_specs: Vec<FieldSpec>,
}

#[derive(Debug, Deserialize)]
struct FieldSpec {
    path: String,
    #[serde(default)]
    create: bool,
    #[serde(default)]
    kind: Option<String>,
}

impl MetadataTransformer {
    fn apply(&self, path: &Path, objects: &mut [Value]) -> Result<(), OverlayError> {
        let (values, default_path) = match self.kind.as_str() {
            "LabelTransformer" => (&self.labels, "metadata/labels"),
            "AnnotationsTransformer" => (&self.annotations, "metadata/annotations"),
            other => return Err(descriptor(path, format!("unsupported transformer kind '{other}'"))),
        };
        let fallback = [FieldSpec {
            path: default_path.to_string(),
            create: true,
            kind: None,
        }];
        let specs = if self.field_specs.is_empty() { &fallback[..] } else { &self.field_specs[..] };

        for object in objects.iter_mut() {
            for spec in specs {
                if spec.kind.as_deref().map_or(false, |k| k != kind_of(object)) {
                    continue;
                }
                if let Some(fields) = field_at(object, &spec.path, spec.create) {
                    for (key, value) in values {
                        fields.insert(key.clone(), Value::String(value.clone()));
                    }
                }
            }
        }
        Ok(())
    }
}

fn field_at<'a>(object: &'a mut Value, path: &str, create: bool) -> Option<&'a mut Map<String, Value>> {
    let mut current = object;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let map = current.as_object_mut()?;
        if !map.contains_key(segment) {
            if !create {
                return None;
            }
            map.insert(segment.to_string(), Value::Object(Map::new()));
        }
        current = map.get_mut(segment)?;
    }
    current.as_object_mut()
}

// --- object helpers ---

fn kind_of(object: &Value) -> &str {
    object.get("kind").and_then(Value::as_str).unwrap_or_default()
}

fn name_of(object: &Value) -> &str {
    object.pointer("/metadata/name").and_then(Value::as_str).unwrap_or_default()
}

fn is_cluster_scoped(object: &Value) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind_of(object))
}

fn set_metadata(object: &mut Value, key: &str, value: &str) {
    if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.insert(key.to_string(), Value::String(value.to_string()));
    }
}

fn describe(object: &Value) -> String {
    format!("{}/{}", kind_of(object), name_of(object))
}
