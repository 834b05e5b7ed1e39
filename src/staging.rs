//! Work directory staging
//!
//! Copies a versioned source tree into a scratch directory and writes the
//! support files and overlay descriptors the overlay engine consumes:
//!
//! ```text
//! work/
//!   <component>.yaml          copied base manifests
//!   policies.yaml             copied RBAC, namespace substituted
//!   roles/kustomization.yaml
//!   namespace.yaml
//!   labels.yaml               LabelTransformer
//!   annotations.yaml          AnnotationsTransformer
//!   node-selector.yaml        pod placement patch
//!   pvc.yaml                  only with persistent storage
//!   sync.yaml                 only with a sync source
//!   shards/<shard>/kustomization.yaml
//!   kustomization.yaml
//! ```

use std::fs;
use std::path::Path;

use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;
use walkdir::WalkDir;

use crate::config::{BuildOptions, Component, Sharding, DEFAULT_NAMESPACE};
use crate::error::{Error, Result};
use crate::features::SHARDED_CONTROLLERS;
use crate::inputs::FactSet;
use crate::overlay::{ImageOverride, Kustomization, PatchEntry, Target, KUSTOMIZATION_FILE};
use crate::resources::{parse_yaml_documents, to_yaml_stream};
use crate::templates::TemplateEngine;

pub const POLICIES_FILE: &str = "policies.yaml";
pub const ROLES_DIR: &str = "roles";
pub const SHARDS_DIR: &str = "shards";

const NAMESPACE_FILE: &str = "namespace.yaml";
const LABELS_FILE: &str = "labels.yaml";
const ANNOTATIONS_FILE: &str = "annotations.yaml";
const NODE_SELECTOR_FILE: &str = "node-selector.yaml";
const PVC_FILE: &str = "pvc.yaml";
const SYNC_FILE: &str = "sync.yaml";

const TOKEN_RESOURCE: &str = "serviceaccounts/token";

const NAMESPACE_TEMPLATE: &str = r#"apiVersion: v1
kind: Namespace
metadata:
  name: << inputs.namespace >>
  labels:
    pod-security.kubernetes.io/warn: restricted
    pod-security.kubernetes.io/warn-version: latest
"#;

const LABELS_TEMPLATE: &str = r#"apiVersion: builtin
kind: LabelTransformer
metadata:
  name: labels
labels:
  app.kubernetes.io/instance: << inputs.namespace | quote >>
  app.kubernetes.io/part-of: flux
  app.kubernetes.io/version: << inputs.version | quote >>
fieldSpecs:
  - path: metadata/labels
    create: true
"#;

const ANNOTATIONS_TEMPLATE: &str = r#"apiVersion: builtin
kind: AnnotationsTransformer
metadata:
  name: annotations
annotations:
  fluxcd.controlplane.io/distribution: << inputs.version | quote >>
fieldSpecs:
  - path: metadata/annotations
    create: true
"#;

const NODE_SELECTOR_TEMPLATE: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: all
spec:
  template:
    spec:
<% if inputs.node_selector %>
      nodeSelector:
<% for key, value in inputs.node_selector | items %>
        << key | quote >>: << value | quote >>
<% endfor %>
<% endif %>
<% if inputs.toleration_keys %>
      tolerations:
<% for key in inputs.toleration_keys %>
        - key: << key | quote >>
          operator: Exists
<% endfor %>
<% endif %>
<% if inputs.image_pull_secret %>
      imagePullSecrets:
        - name: << inputs.image_pull_secret | quote >>
<% endif %>
"#;

const PVC_TEMPLATE: &str = r#"apiVersion: v1
kind: PersistentVolumeClaim
metadata:
  name: source-controller
spec:
  accessModes:
    - ReadWriteOnce
  storageClassName: << inputs.storage.class | quote >>
  resources:
    requests:
      storage: << inputs.storage.size | quote >>
"#;

const PVC_PATCH: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: source-controller
spec:
  template:
    spec:
      volumes:
        - name: data
          emptyDir: null
          persistentVolumeClaim:
            claimName: source-controller
"#;

const SYNC_TEMPLATE: &str = r#"apiVersion: << inputs.sync.api_version >>
kind: << inputs.sync.kind >>
metadata:
  name: << inputs.sync.name | quote >>
spec:
  interval: << inputs.sync.interval | quote >>
<% if inputs.sync.kind == "Bucket" %>
  endpoint: << inputs.sync.url | quote >>
  bucketName: << inputs.sync.reference | quote >>
<% elif inputs.sync.kind == "OCIRepository" %>
  url: << inputs.sync.url | quote >>
  ref:
    tag: << inputs.sync.reference | quote >>
<% else %>
  url: << inputs.sync.url | quote >>
  ref:
    name: << inputs.sync.reference | quote >>
<% endif %>
<% if inputs.sync.pull_secret %>
  secretRef:
    name: << inputs.sync.pull_secret | quote >>
<% endif %>
---
apiVersion: kustomize.toolkit.fluxcd.io/v1
kind: Kustomization
metadata:
  name: << inputs.sync.name | quote >>
spec:
  interval: 10m
  path: << inputs.sync.path | quote >>
  prune: true
  sourceRef:
    kind: << inputs.sync.kind >>
    name: << inputs.sync.name | quote >>
"#;

/// Stage `source_dir` and every generated file into `work_dir`.
pub fn stage(
    engine: &TemplateEngine,
    source_dir: &Path,
    work_dir: &Path,
    options: &BuildOptions,
) -> Result<()> {
    for component in &options.components {
        if !source_dir.join(component.manifest_file()).is_file() {
            return Err(Error::config(format!(
                "{} has no manifest for {component}",
                source_dir.display()
            )));
        }
    }

    copy_tree(source_dir, work_dir)?;

    let facts = support_facts(options);
    let render = |name: &str, template: &str| -> Result<()> {
        let text = engine
            .render_str(template, &facts)
            .map_err(|e| Error::config(format!("failed to render {name}: {e}")))?;
        write(&work_dir.join(name), &text)
    };

    render(NAMESPACE_FILE, NAMESPACE_TEMPLATE)?;
    render(LABELS_FILE, LABELS_TEMPLATE)?;
    render(ANNOTATIONS_FILE, ANNOTATIONS_TEMPLATE)?;
    let pod_settings = has_pod_settings(options);
    if pod_settings {
        render(NODE_SELECTOR_FILE, NODE_SELECTOR_TEMPLATE)?;
    }
    if options.storage.is_some() {
        render(PVC_FILE, PVC_TEMPLATE)?;
    }
    if options.sync.is_some() {
        render(SYNC_FILE, SYNC_TEMPLATE)?;
    }

    let policies = work_dir.join(POLICIES_FILE);
    if policies.is_file() {
        if options.namespace != DEFAULT_NAMESPACE {
            substitute_namespace(&policies, &options.namespace)?;
        }
        if options.remove_token_permission {
            remove_token_permission(&policies)?;
        }
    }

    let has_roles = stage_roles(work_dir)?;
    if let Some(sharding) = &options.sharding {
        for shard in &sharding.shards {
            let kustomization = shard_kustomization(options, sharding, shard);
            write_kustomization(&work_dir.join(SHARDS_DIR).join(shard), &kustomization)?;
        }
    }

    let root = root_kustomization(options, policies.is_file(), has_roles, pod_settings)?;
    write_kustomization(work_dir, &root)?;

    debug!(work_dir = %work_dir.display(), "work directory staged");
    Ok(())
}

/// Copy every file under `source` into `dest`, keeping relative paths.
pub fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            Error::io(format!("failed to walk {}", source.display()), e.into())
        })?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| Error::config(format!("unexpected path in source tree: {e}")))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .map_err(|e| Error::io(format!("failed to create {}", target.display()), e))?;
        } else {
            fs::copy(entry.path(), &target)
                .map_err(|e| Error::io(format!("failed to copy {}", entry.path().display()), e))?;
        }
    }
    Ok(())
}

fn write(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("failed to create {}", parent.display()), e))?;
    }
    fs::write(path, content).map_err(|e| Error::io(format!("failed to write {}", path.display()), e))
}

fn write_kustomization(dir: &Path, kustomization: &Kustomization) -> Result<()> {
    let text = serde_yaml::to_string(kustomization)?;
    write(&dir.join(KUSTOMIZATION_FILE), &text)
}

fn support_facts(options: &BuildOptions) -> FactSet {
    let mut facts = FactSet::new();
    facts.insert("namespace".to_string(), json!(options.namespace));
    facts.insert("version".to_string(), json!(options.version));
    facts.insert("node_selector".to_string(), json!(options.node_selector));
    facts.insert("toleration_keys".to_string(), json!(options.toleration_keys));
    facts.insert("image_pull_secret".to_string(), json!(options.image_pull_secret));
    facts.insert(
        "storage".to_string(),
        match &options.storage {
            Some(storage) => json!({ "class": storage.class, "size": storage.size }),
            None => Value::Null,
        },
    );
    facts.insert(
        "sync".to_string(),
        match &options.sync {
            Some(sync) => json!({
                "api_version": sync.kind.api_version(),
                "kind": format!("{:?}", sync.kind),
                "name": sync.name.clone().unwrap_or_else(|| options.namespace.clone()),
                "url": sync.url,
                "reference": sync.reference,
                "path": sync.path,
                "interval": sync.interval,
                "pull_secret": sync.pull_secret,
            }),
            None => Value::Null,
        },
    );
    facts
}

fn has_pod_settings(options: &BuildOptions) -> bool {
    !options.node_selector.is_empty()
        || !options.toleration_keys.is_empty()
        || options.image_pull_secret.is_some()
}

/// Rewrite `namespace: flux-system` fields of the base RBAC.
///
/// ClusterRoleBinding subjects are not reached by the namespace transformer,
/// so the copied file is rewritten once before the overlay runs.
pub fn substitute_namespace(path: &Path, namespace: &str) -> Result<()> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
    let pattern = format!(r"(?m)^([ \t]*(?:-[ \t]+)?namespace:[ \t]*){DEFAULT_NAMESPACE}[ \t]*$");
    let re = Regex::new(&pattern).map_err(|e| Error::config(e.to_string()))?;
    let replaced = re.replace_all(&content, format!("${{1}}{namespace}"));
    write(path, &replaced)
}

/// Drop the `create` grant on `serviceaccounts/token` from every ClusterRole.
pub fn remove_token_permission(path: &Path) -> Result<()> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
    let mut documents = parse_yaml_documents(&content)?;
    for document in &mut documents {
        if document.get("kind").and_then(Value::as_str) != Some("ClusterRole") {
            continue;
        }
        if let Some(Value::Array(rules)) = document.get_mut("rules") {
            rules.retain_mut(|rule| !strip_token_grant(rule));
        }
    }
    write(path, &to_yaml_stream(&documents)?)
}

/// Removes the token resource from a rule granting `create`; returns whether
/// the rule is left without resources.
fn strip_token_grant(rule: &mut Value) -> bool {
    let grants_create = rule
        .get("verbs")
        .and_then(Value::as_array)
        .map_or(false, |verbs| verbs.iter().any(|v| v == "create" || v == "*"));
    if !grants_create {
        return false;
    }
    match rule.get_mut("resources") {
        Some(Value::Array(resources)) => {
            let before = resources.len();
            resources.retain(|r| r != TOKEN_RESOURCE);
            before != resources.len() && resources.is_empty()
        }
        _ => false,
    }
}

/// List every manifest under `roles/` in a kustomization; false if there is
/// no roles directory.
fn stage_roles(work_dir: &Path) -> Result<bool> {
    let dir = work_dir.join(ROLES_DIR);
    if !dir.is_dir() {
        return Ok(false);
    }
    let mut kustomization = Kustomization::new();
    for entry in WalkDir::new(&dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::io(format!("failed to walk {}", dir.display()), e.into()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        let is_manifest = name.ends_with(".yaml") || name.ends_with(".yml");
        if entry.file_type().is_file() && is_manifest && name != KUSTOMIZATION_FILE {
            kustomization.resources.push(name);
        }
    }
    write_kustomization(&dir, &kustomization)?;
    Ok(true)
}

fn shard_kustomization(options: &BuildOptions, sharding: &Sharding, shard: &str) -> Kustomization {
    let components: Vec<Component> = SHARDED_CONTROLLERS
        .iter()
        .copied()
        .filter(|c| options.has_component(*c))
        .collect();

    let mut kustomization = Kustomization::new();
    kustomization.name_suffix = Some(format!("-{shard}"));
    kustomization.resources = components
        .iter()
        .map(|c| format!("../../{}", c.manifest_file()))
        .collect();

    // shards reuse the CRDs, services and accounts of the main controllers
    for (kind, api_version) in [
        ("CustomResourceDefinition", "apiextensions.k8s.io/v1"),
        ("Service", "v1"),
        ("ServiceAccount", "v1"),
    ] {
        kustomization.patches.push(PatchEntry {
            path: None,
            patch: Some(format!(
                "$patch: delete\napiVersion: {api_version}\nkind: {kind}\nmetadata:\n  name: _\n"
            )),
            target: Some(Target {
                kind: Some(kind.to_string()),
                ..Default::default()
            }),
        });
    }

    for component in &components {
        let app = format!("{component}-{shard}");
        let selector = format!("--watch-label-selector={} in ({shard})", sharding.key);
        let operations = json!([
            { "op": "replace", "path": "/spec/selector/matchLabels/app", "value": app },
            { "op": "replace", "path": "/spec/template/metadata/labels/app", "value": app },
            { "op": "add", "path": "/spec/template/spec/containers/0/args/-", "value": selector },
        ]);
        kustomization.patches.push(PatchEntry {
            path: None,
            patch: Some(operations.to_string()),
            target: Some(Target {
                kind: Some("Deployment".to_string()),
                name: Some(component.as_str().to_string()),
                ..Default::default()
            }),
        });
    }
    kustomization
}

fn root_kustomization(
    options: &BuildOptions,
    has_policies: bool,
    has_roles: bool,
    pod_settings: bool,
) -> Result<Kustomization> {
    let mut kustomization = Kustomization::new();
    kustomization.namespace = Some(options.namespace.clone());

    kustomization.resources.push(NAMESPACE_FILE.to_string());
    if has_policies {
        kustomization.resources.push(POLICIES_FILE.to_string());
    }
    if has_roles {
        kustomization.resources.push(ROLES_DIR.to_string());
    }
    for component in &options.components {
        kustomization.resources.push(component.manifest_file());
    }
    if options.storage.is_some() {
        kustomization.resources.push(PVC_FILE.to_string());
    }
    if options.sync.is_some() {
        kustomization.resources.push(SYNC_FILE.to_string());
    }
    if let Some(sharding) = &options.sharding {
        for shard in &sharding.shards {
            kustomization.resources.push(format!("{SHARDS_DIR}/{shard}"));
        }
    }

    kustomization.transformers = vec![LABELS_FILE.to_string(), ANNOTATIONS_FILE.to_string()];

    kustomization.images = options
        .component_images
        .iter()
        .map(|image| ImageOverride {
            name: image.source.clone(),
            new_name: Some(image.repository.clone()),
            new_tag: Some(image.tag.clone()),
            digest: image.digest.clone(),
        })
        .collect();

    if pod_settings {
        kustomization.patches.push(PatchEntry {
            path: Some(NODE_SELECTOR_FILE.to_string()),
            patch: None,
            target: Some(Target {
                kind: Some("Deployment".to_string()),
                ..Default::default()
            }),
        });
    }
    if options.storage.is_some() && options.has_component(Component::SourceController) {
        kustomization.patches.push(PatchEntry {
            path: None,
            patch: Some(PVC_PATCH.to_string()),
            target: Some(Target {
                kind: Some("Deployment".to_string()),
                name: Some(Component::SourceController.as_str().to_string()),
                ..Default::default()
            }),
        });
    }
    if !options.patches.is_empty() {
        let entries: Vec<PatchEntry> = serde_yaml::from_str(options.patches.as_str())
            .map_err(|e| Error::config(format!("invalid overlay patches: {e}")))?;
        kustomization.patches.extend(entries);
    }
    Ok(kustomization)
}
