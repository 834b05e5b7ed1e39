//! Rendered objects - identity, exclusion and canonical apply order

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Objects carrying this annotation with [`RECONCILE_DISABLED`] are dropped
/// after rendering.
pub const RECONCILE_ANNOTATION: &str = "fluxcd.controlplane.io/reconcile";
pub const RECONCILE_DISABLED: &str = "disabled";

/// Apply order of well-known kinds; anything else goes after them.
const KIND_ORDER: [&str; 24] = [
    "CustomResourceDefinition",
    "Namespace",
    "ResourceQuota",
    "StorageClass",
    "ServiceAccount",
    "PodSecurityPolicy",
    "Role",
    "ClusterRole",
    "RoleBinding",
    "ClusterRoleBinding",
    "ConfigMap",
    "Secret",
    "Endpoints",
    "Service",
    "LimitRange",
    "PriorityClass",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "Deployment",
    "StatefulSet",
    "CronJob",
    "PodDisruptionBudget",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
];

#[derive(Debug, Error)]
#[error("invalid object: {0}")]
pub struct InvalidResource(pub String);

/// Dedup identity: (apiVersion, kind, namespace, name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// A structured object with apiVersion, kind and metadata.name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Resource {
    object: Map<String, Value>,
}

impl TryFrom<Value> for Resource {
    type Error = InvalidResource;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let object = match value {
            Value::Object(object) => object,
            other => {
                return Err(InvalidResource(format!("expected a mapping, got {}", type_name(&other))));
            }
        };
        for field in ["apiVersion", "kind"] {
            if !object.get(field).map_or(false, Value::is_string) {
                return Err(InvalidResource(format!("missing string field '{field}'")));
            }
        }
        let has_name = object
            .get("metadata")
            .and_then(|m| m.get("name"))
            .map_or(false, Value::is_string);
        if !has_name {
            return Err(InvalidResource("missing string field 'metadata.name'".to_string()));
        }
        Ok(Self { object })
    }
}

impl From<Resource> for Value {
    fn from(resource: Resource) -> Self {
        Value::Object(resource.object)
    }
}

impl Resource {
    pub fn api_version(&self) -> &str {
        self.str_field(&["apiVersion"]).unwrap_or_default()
    }

    pub fn kind(&self) -> &str {
        self.str_field(&["kind"]).unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.str_field(&["metadata", "name"]).unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.str_field(&["metadata", "namespace"])
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.str_field(&["metadata", "annotations", key])
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.str_field(&["metadata", "labels", key])
    }

    pub fn id(&self) -> ResourceId {
        ResourceId {
            api_version: self.api_version().to_string(),
            kind: self.kind().to_string(),
            namespace: self.namespace().unwrap_or_default().to_string(),
            name: self.name().to_string(),
        }
    }

    pub fn is_reconcile_disabled(&self) -> bool {
        self.annotation(RECONCILE_ANNOTATION) == Some(RECONCILE_DISABLED)
    }

    pub fn as_object(&self) -> &Map<String, Value> {
        &self.object
    }

    /// Look up a nested field, e.g. `&["spec", "replicas"]`.
    pub fn get(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        rest.iter().try_fold(self.object.get(*first)?, |v, key| v.get(key))
    }

    fn str_field(&self, path: &[&str]) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.object)
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.namespace() {
            Some(ns) => write!(f, "{}/{}/{}", self.kind(), ns, self.name()),
            None => write!(f, "{}/{}", self.kind(), self.name()),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

/// Accumulates rendered objects: excluded objects are dropped, and the first
/// object with a given identity wins.
#[derive(Debug, Default)]
pub struct ResourceSet {
    seen: BTreeSet<ResourceId>,
    resources: Vec<Resource>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the object was kept.
    pub fn insert(&mut self, resource: Resource) -> bool {
        if resource.is_reconcile_disabled() {
            return false;
        }
        if !self.seen.insert(resource.id()) {
            return false;
        }
        self.resources.push(resource);
        true
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn into_resources(self) -> Vec<Resource> {
        self.resources
    }
}

/// Parse a multi-document YAML stream, skipping empty documents.
pub fn parse_yaml_documents(text: &str) -> Result<Vec<Value>, serde_yaml::Error> {
    let mut documents = vec![];
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = Value::deserialize(document)?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    Ok(documents)
}

/// Serialize documents into a single `---` separated stream.
pub fn to_yaml_stream<T: Serialize>(documents: &[T]) -> Result<String, serde_yaml::Error> {
    let mut out = String::new();
    for document in documents {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(document)?);
    }
    Ok(out)
}

fn kind_rank(kind: &str) -> usize {
    KIND_ORDER
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(KIND_ORDER.len())
}

/// Canonical apply ordering: well-known kinds first, then kind, namespace, name.
pub fn apply_order(a: &Resource, b: &Resource) -> Ordering {
    kind_rank(a.kind())
        .cmp(&kind_rank(b.kind()))
        .then_with(|| a.kind().cmp(b.kind()))
        .then_with(|| a.namespace().unwrap_or_default().cmp(b.namespace().unwrap_or_default()))
        .then_with(|| a.name().cmp(b.name()))
}

pub fn sort_for_apply(resources: &mut [Resource]) {
    resources.sort_by(apply_order);
}
