//! Contract Invariant Tests
//!
//! End-to-end guarantees of a compilation against a fixture release tree.

use std::fs;
use std::path::Path;

use fluxdistro_core::config::{Cluster, ClusterProfile, Sharding};
use fluxdistro_core::overlay::PatchEntry;
use fluxdistro_core::{
    combine_providers, compile, BuildResult, BuiltinOverlay, Component, DistributionConfig, Error,
    InputProvider, InputStrategy, Resource, ResourceSet, SlugOptions, TemplateEngine, WorkloadIdentity,
};
use serde_json::{json, Value};
use tempfile::TempDir;

const POLICIES: &str = r#"apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: flux-edit
rules:
  - apiGroups: [""]
    resources: ["serviceaccounts/token"]
    verbs: ["create"]
  - apiGroups: ["source.toolkit.fluxcd.io"]
    resources: ["*"]
    verbs: ["*"]
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: cluster-reconciler
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: cluster-admin
subjects:
  - kind: ServiceAccount
    name: kustomize-controller
    namespace: flux-system
"#;

const VIEW_ROLE: &str = r#"apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: flux-view
rules:
  - apiGroups: ["source.toolkit.fluxcd.io"]
    resources: ["*"]
    verbs: ["get", "list", "watch"]
"#;

fn component_manifest(name: &str) -> String {
    // notification-controller ships without security contexts
    let (pod_security, container_security) = if name == "notification-controller" {
        (String::new(), String::new())
    } else {
        (
            "      securityContext:\n        fsGroup: 1337\n".to_string(),
            "          securityContext:\n            runAsNonRoot: true\n            runAsUser: 65534\n            seccompProfile:\n              type: RuntimeDefault\n".to_string(),
        )
    };
    format!(
        r#"apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: {name}s.toolkit.fluxcd.io
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: {name}
  namespace: flux-system
---
apiVersion: v1
kind: Service
metadata:
  name: {name}
  namespace: flux-system
spec:
  selector:
    app: {name}
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: {name}
  namespace: flux-system
spec:
  selector:
    matchLabels:
      app: {name}
  template:
    metadata:
      labels:
        app: {name}
    spec:
      serviceAccountName: {name}
{pod_security}      containers:
        - name: manager
          image: ghcr.io/fluxcd/{name}:v0.0.1
{container_security}          args:
            - --log-level=info
"#
    )
}

fn write_release(data_dir: &Path, release: &str) {
    let root = data_dir.join(release);
    fs::create_dir_all(root.join("roles")).unwrap();
    fs::create_dir_all(root.join("images")).unwrap();

    let mut payload = String::from("images:\n");
    for component in Component::ALL {
        fs::write(root.join(component.manifest_file()), component_manifest(component.as_str())).unwrap();
        payload.push_str(&format!(
            "  - name: ghcr.io/fluxcd/{component}\n    newTag: {release}\n    digest: sha256:{}\n",
            "a".repeat(64)
        ));
    }
    fs::write(root.join("images").join("upstream-alpine.yaml"), payload).unwrap();
    fs::write(root.join("policies.yaml"), POLICIES).unwrap();
    fs::write(root.join("roles").join("flux-view.yaml"), VIEW_ROLE).unwrap();
}

fn data_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    for release in ["v2.5.0", "v2.6.4", "v2.7.0"] {
        write_release(dir.path(), release);
    }
    dir
}

fn build(data: &TempDir, config: &DistributionConfig) -> Result<BuildResult, Error> {
    let work = TempDir::new().unwrap();
    compile(data.path(), work.path(), config, Box::new(BuiltinOverlay))
}

fn config(version: &str) -> DistributionConfig {
    DistributionConfig {
        version: version.to_string(),
        ..Default::default()
    }
}

fn find<'a>(result: &'a BuildResult, kind: &str, name: &str) -> &'a Resource {
    result
        .objects
        .iter()
        .find(|o| o.kind() == kind && o.name() == name)
        .unwrap_or_else(|| panic!("{kind}/{name} not found"))
}

fn args(deployment: &Resource) -> Vec<String> {
    deployment
        .get(&["spec", "template", "spec", "containers"])
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("args"))
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
        .unwrap_or_default()
}

#[test]
fn invariant_build_digest_stable() {
    let data = data_dir();
    let config = config("2.x");

    let first = build(&data, &config).unwrap();
    let second = build(&data, &config).unwrap();

    assert_eq!(first.version, "v2.7.0");
    assert_eq!(first.digest, second.digest);
    assert_eq!(first.manifest, second.manifest);
    assert_eq!(first.revision, format!("v2.7.0@{}", first.digest));
    assert!(first.digest.starts_with("sha256:"));
}

#[test]
fn invariant_objects_in_apply_order() {
    let data = data_dir();
    let result = build(&data, &config("2.7.0")).unwrap();

    let kinds: Vec<&str> = result.objects.iter().map(Resource::kind).collect();
    let first_deployment = kinds.iter().position(|k| *k == "Deployment").unwrap();
    let last_crd = kinds.iter().rposition(|k| *k == "CustomResourceDefinition").unwrap();
    assert!(last_crd < first_deployment);
    assert_eq!(kinds[0], "CustomResourceDefinition");

    let namespace = find(&result, "Namespace", "flux-system");
    assert_eq!(namespace.label("app.kubernetes.io/instance"), Some("flux-system"));
    assert_eq!(find(&result, "ClusterRole", "flux-view").label("app.kubernetes.io/version"), Some("v2.7.0"));
}

#[test]
fn invariant_images_pinned_to_payload() {
    let data = data_dir();
    let result = build(&data, &config("2.7.0")).unwrap();

    let deployment = find(&result, "Deployment", "source-controller");
    let image = deployment
        .get(&["spec", "template", "spec", "containers"])
        .and_then(|c| c[0]["image"].as_str())
        .unwrap()
        .to_string();
    assert_eq!(image, format!("ghcr.io/fluxcd/source-controller:v2.7.0@sha256:{}", "a".repeat(64)));
    assert_eq!(result.component_images.len(), 4);
}

#[test]
fn invariant_namespace_substituted_everywhere() {
    let data = data_dir();
    let config = DistributionConfig {
        namespace: "gitops".to_string(),
        ..config("2.7.0")
    };
    let result = build(&data, &config).unwrap();

    let binding = find(&result, "ClusterRoleBinding", "cluster-reconciler");
    assert_eq!(binding.get(&["subjects"]).unwrap()[0]["namespace"], json!("gitops"));
    assert_eq!(find(&result, "Deployment", "helm-controller").namespace(), Some("gitops"));
    assert!(!result.manifest.contains("flux-system"));
}

#[test]
fn invariant_workload_identity_rejected_before_2_6() {
    let data = data_dir();
    let config = DistributionConfig {
        workload_identity: WorkloadIdentity {
            object_level: true,
            ..Default::default()
        },
        ..config("2.5.0")
    };
    let err = build(&data, &config).unwrap_err();
    assert!(err.is_policy_violation());
    assert!(err.to_string().contains("< 2.6.0"));
}

#[test]
fn invariant_multi_tenant_identity_patches() {
    let data = data_dir();
    let config = DistributionConfig {
        workload_identity: WorkloadIdentity {
            object_level: true,
            multi_tenant: true,
            default_service_account: Some("tenant".to_string()),
            ..Default::default()
        },
        ..config("2.7.0")
    };
    let result = build(&data, &config).unwrap();

    let kustomize = args(find(&result, "Deployment", "kustomize-controller"));
    assert!(kustomize.contains(&"--feature-gates=ObjectLevelWorkloadIdentity=true".to_string()));
    assert!(kustomize.contains(&"--default-decryption-service-account=default".to_string()));
    assert!(kustomize.contains(&"--default-kubeconfig-service-account=default".to_string()));

    let source = args(find(&result, "Deployment", "source-controller"));
    assert!(source.contains(&"--default-service-account=tenant".to_string()));

    // object-level identity keeps the token grant
    let role = find(&result, "ClusterRole", "flux-edit");
    assert_eq!(role.get(&["rules"]).unwrap().as_array().unwrap().len(), 2);
}

#[test]
fn invariant_token_permission_removed_without_identity() {
    let data = data_dir();
    let result = build(&data, &config("2.7.0")).unwrap();

    let role = find(&result, "ClusterRole", "flux-edit");
    let rules = role.get(&["rules"]).unwrap().as_array().unwrap();
    assert_eq!(rules.len(), 1);
    assert!(!result.manifest.contains("serviceaccounts/token"));

    let source = args(find(&result, "Deployment", "source-controller"));
    assert!(source.contains(&"--feature-gates=ObjectLevelWorkloadIdentity=false".to_string()));
}

#[test]
fn invariant_unexpected_patch_op_is_surfaced() {
    let data = data_dir();
    let config = DistributionConfig {
        patches: vec![PatchEntry {
            path: None,
            patch: Some("- op: removes\n  path: /spec/replicas\n".to_string()),
            target: Some(fluxdistro_core::overlay::Target {
                kind: Some("Deployment".to_string()),
                ..Default::default()
            }),
        }],
        ..config("2.7.0")
    };
    let err = build(&data, &config).unwrap_err();
    assert!(matches!(err, Error::Overlay(_)));
    assert!(err.to_string().contains("Unexpected kind: removes"));
}

#[test]
fn invariant_shards_are_isolated() {
    let data = data_dir();
    let config = DistributionConfig {
        sharding: Some(Sharding {
            key: "sharding.fluxcd.io/key".to_string(),
            shards: vec!["shard1".to_string(), "shard2".to_string()],
        }),
        ..config("2.7.0")
    };
    let result = build(&data, &config).unwrap();

    let main = args(find(&result, "Deployment", "kustomize-controller"));
    assert!(main.contains(&"--watch-label-selector=!sharding.fluxcd.io/key".to_string()));

    let shard = find(&result, "Deployment", "kustomize-controller-shard1");
    let shard_args = args(shard);
    assert!(shard_args.contains(&"--watch-label-selector=sharding.fluxcd.io/key in (shard1)".to_string()));
    assert!(!shard_args.iter().any(|a| a.starts_with("--watch-label-selector=!")));
    assert_eq!(
        shard.get(&["spec", "selector", "matchLabels", "app"]),
        Some(&json!("kustomize-controller-shard1"))
    );
    assert!(shard_args.contains(&"--feature-gates=ObjectLevelWorkloadIdentity=false".to_string()));

    assert!(result.objects.iter().all(|o| o.name() != "kustomize-controller-shard1" || o.kind() == "Deployment"));
    find(&result, "Deployment", "helm-controller-shard2");
    assert!(result.objects.iter().all(|o| o.name() != "notification-controller-shard1"));
}

#[test]
fn invariant_openshift_profile() {
    let data = data_dir();
    let config = DistributionConfig {
        cluster: Cluster {
            profile: ClusterProfile::Openshift,
            ..Default::default()
        },
        ..config("2.7.0")
    };
    let result = build(&data, &config).unwrap();

    let source = find(&result, "Deployment", "source-controller");
    assert!(source.get(&["spec", "template", "spec", "securityContext"]).is_none());
    let container = &source.get(&["spec", "template", "spec", "containers"]).unwrap()[0];
    assert_eq!(container["securityContext"], json!({ "runAsNonRoot": true }));

    // deployments without security contexts build unchanged
    let notification = find(&result, "Deployment", "notification-controller");
    let pod = notification.get(&["spec", "template", "spec"]).unwrap();
    assert!(pod.get("securityContext").is_none());
    assert!(pod["containers"][0].get("securityContext").is_none());
    assert_eq!(pod["containers"].as_array().unwrap().len(), 1);
}

#[test]
fn invariant_sharding_rejected_before_2_2() {
    let data = TempDir::new().unwrap();
    write_release(data.path(), "v2.1.2");
    let config = DistributionConfig {
        sharding: Some(Sharding {
            key: "sharding.fluxcd.io/key".to_string(),
            shards: vec!["shard1".to_string()],
        }),
        ..config("2.1.2")
    };
    let err = build(&data, &config).unwrap_err();
    assert!(err.is_policy_violation());
}

#[test]
fn invariant_unknown_version_is_input_error() {
    let data = data_dir();
    let err = build(&data, &config("3.x")).unwrap_err();
    assert!(matches!(err, Error::VersionNotFound(..)));
    assert!(err.is_input_error());
}

#[test]
fn invariant_permute_three_by_four() {
    let regions: Vec<_> = ["eu", "us", "ap"]
        .iter()
        .map(|r| json!({ "region": r }).as_object().unwrap().clone())
        .collect();
    let tenants: Vec<_> = ["a", "b", "c", "d"]
        .iter()
        .map(|t| json!({ "tenant": t }).as_object().unwrap().clone())
        .collect();
    let providers = vec![
        InputProvider {
            name: "regions".to_string(),
            inputs: regions,
        },
        InputProvider {
            name: "tenants".to_string(),
            inputs: tenants,
        },
    ];

    let sets = combine_providers(InputStrategy::Permute, &providers).unwrap();
    assert_eq!(sets.len(), 12);
    let mut ids: Vec<&str> = sets.iter().map(|s| s["id"].as_str().unwrap()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 12);

    let flat = combine_providers(InputStrategy::Flatten, &providers).unwrap();
    assert_eq!(flat.len(), 7);
}

#[test]
fn invariant_rendered_set_excludes_and_dedups() {
    let engine = TemplateEngine::new(SlugOptions::default()).unwrap();
    let template = r#"apiVersion: v1
kind: Namespace
metadata:
  name: << inputs.tenants.tenant >>
<% if inputs.tenants.tenant == "skip" %>
  annotations:
    fluxcd.controlplane.io/reconcile: disabled
<% endif %>
---
apiVersion: v1
kind: Namespace
metadata:
  name: shared
"#;
    let tenants: Vec<_> = ["a", "skip", "b"]
        .iter()
        .map(|t| json!({ "tenant": t }).as_object().unwrap().clone())
        .collect();
    let sets = combine_providers(
        InputStrategy::Permute,
        &[InputProvider {
            name: "tenants".to_string(),
            inputs: tenants,
        }],
    )
    .unwrap();

    let mut acc = ResourceSet::new();
    engine.render_document_set(0, template, &sets, &mut acc).unwrap();
    let names: Vec<String> = acc.into_resources().iter().map(|r| r.name().to_string()).collect();
    assert_eq!(names, vec!["a", "shared", "b"]);
}
