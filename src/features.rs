//! Version & feature resolver
//!
//! Decides which optional capabilities are legal for a resolved distribution
//! version and which overlay patches they require. Every function here is a
//! pure function of its inputs: the same version and flags always produce
//! byte-identical patch text.

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::config::{BuildOptions, Cluster, ClusterProfile, Component, Sharding, DEFAULT_CLUSTER_DOMAIN};
use crate::error::{Error, Result};
use crate::version::{at_least, WorkloadIdentitySupport};

const FEATURE_GATE: &str = "ObjectLevelWorkloadIdentity";
const DEFAULT_SERVICE_ACCOUNT: &str = "default";

/// Controllers honoring the workload identity feature gate in 2.6.x.
const EARLY_IDENTITY_CONTROLLERS: [Component; 5] = [
    Component::SourceController,
    Component::KustomizeController,
    Component::NotificationController,
    Component::ImageReflectorController,
    Component::ImageAutomationController,
];

/// From 2.7.0 helm-controller honors the gate as well.
const FULL_IDENTITY_CONTROLLERS: [Component; 6] = [
    Component::SourceController,
    Component::KustomizeController,
    Component::HelmController,
    Component::NotificationController,
    Component::ImageReflectorController,
    Component::ImageAutomationController,
];

const DEFAULT_SA_CONTROLLERS: [Component; 4] = [
    Component::SourceController,
    Component::NotificationController,
    Component::ImageReflectorController,
    Component::ImageAutomationController,
];

const DECRYPTION_SA_CONTROLLERS: [Component; 1] = [Component::KustomizeController];

const KUBECONFIG_SA_CONTROLLERS: [Component; 2] =
    [Component::KustomizeController, Component::HelmController];

/// Controllers that can be split into shards.
pub const SHARDED_CONTROLLERS: [Component; 3] = [
    Component::SourceController,
    Component::KustomizeController,
    Component::HelmController,
];

const CROSS_NAMESPACE_CONTROLLERS: [Component; 5] = [
    Component::KustomizeController,
    Component::HelmController,
    Component::NotificationController,
    Component::ImageReflectorController,
    Component::ImageAutomationController,
];

/// Append-only buffer of kustomize `patches:` list items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSet {
    text: String,
}

impl PatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: impl AsRef<str>) {
        let fragment = fragment.as_ref();
        if fragment.trim().is_empty() {
            return;
        }
        self.text.push_str(fragment);
        if !fragment.ends_with('\n') {
            self.text.push('\n');
        }
    }

    pub fn extend(&mut self, other: &PatchSet) {
        self.push(&other.text);
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Desired workload identity features.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadIdentity {
    #[serde(default)]
    pub object_level: bool,
    #[serde(default)]
    pub multi_tenant: bool,
    #[serde(default)]
    pub default_service_account: Option<String>,
    #[serde(default)]
    pub default_decryption_service_account: Option<String>,
    #[serde(default)]
    pub default_kubeconfig_service_account: Option<String>,
}

/// Configuration delta produced by the workload identity resolver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureDelta {
    pub patches: PatchSet,
    pub remove_token_permission: bool,
}

/// Resolve workload identity for `version`.
///
/// Unparsable versions never get here; callers parse first and report those
/// as input errors.
pub fn resolve_workload_identity(
    version: &Version,
    identity: &WorkloadIdentity,
) -> Result<FeatureDelta> {
    let mut delta = FeatureDelta::default();

    match WorkloadIdentitySupport::for_version(version) {
        WorkloadIdentitySupport::PreWorkloadIdentity => {
            if identity.object_level {
                return Err(Error::policy(
                    "object-level workload identity is not supported in Flux versions < 2.6.0",
                ));
            }
            if identity.multi_tenant {
                return Err(Error::policy(
                    "multi-tenant workload identity is not supported in Flux versions < 2.6.0",
                ));
            }
        }
        WorkloadIdentitySupport::EarlyWorkloadIdentity => {
            if identity.multi_tenant {
                return Err(Error::policy(
                    "multi-tenant workload identity is not supported in Flux versions < 2.7.0",
                ));
            }
            if identity.object_level {
                delta.patches.push(arg_patch(
                    &EARLY_IDENTITY_CONTROLLERS,
                    &format!("--feature-gates={FEATURE_GATE}=true"),
                    true,
                ));
            } else {
                delta.remove_token_permission = true;
            }
        }
        WorkloadIdentitySupport::FullWorkloadIdentity => {
            if identity.multi_tenant && !identity.object_level {
                return Err(Error::policy(
                    "multi-tenant workload identity requires object-level workload identity to be enabled",
                ));
            }
            delta.patches.push(arg_patch(
                &FULL_IDENTITY_CONTROLLERS,
                &format!("--feature-gates={FEATURE_GATE}={}", identity.object_level),
                true,
            ));
            if !identity.object_level {
                delta.remove_token_permission = true;
            }
            if identity.multi_tenant {
                let sa = service_account_or_default(&identity.default_service_account);
                delta.patches.push(arg_patch(
                    &DEFAULT_SA_CONTROLLERS,
                    &format!("--default-service-account={sa}"),
                    true,
                ));
                let sa = service_account_or_default(&identity.default_decryption_service_account);
                delta.patches.push(arg_patch(
                    &DECRYPTION_SA_CONTROLLERS,
                    &format!("--default-decryption-service-account={sa}"),
                    true,
                ));
                let sa = service_account_or_default(&identity.default_kubeconfig_service_account);
                delta.patches.push(arg_patch(
                    &KUBECONFIG_SA_CONTROLLERS,
                    &format!("--default-kubeconfig-service-account={sa}"),
                    true,
                ));
            }
        }
    }

    Ok(delta)
}

/// Apply the workload identity resolver to `options`.
pub fn apply_workload_identity(
    options: &mut BuildOptions,
    version: &Version,
    identity: &WorkloadIdentity,
) -> Result<()> {
    let delta = resolve_workload_identity(version, identity)?;
    options.patches.extend(&delta.patches);
    options.remove_token_permission |= delta.remove_token_permission;
    Ok(())
}

/// Patches for the cluster profile, multi-tenancy lockdown and cluster domain.
pub fn apply_cluster_profile(options: &mut BuildOptions, cluster: &Cluster) -> Result<()> {
    if cluster.domain.trim().is_empty() {
        return Err(Error::config("cluster domain must not be empty"));
    }

    if cluster.profile == ClusterProfile::Openshift {
        options.patches.push(openshift_patch());
    }

    if cluster.multitenant {
        options.patches.push(arg_patch(
            &CROSS_NAMESPACE_CONTROLLERS,
            "--no-cross-namespace-refs=true",
            true,
        ));
        options.patches.push(arg_patch(
            &[Component::KustomizeController],
            "--no-remote-bases=true",
            true,
        ));
        let sa = service_account_or_default(&cluster.tenant_default_service_account);
        options.patches.push(arg_patch(
            &KUBECONFIG_SA_CONTROLLERS,
            &format!("--default-service-account={sa}"),
            true,
        ));
    }

    if cluster.domain != DEFAULT_CLUSTER_DOMAIN {
        let domain = cluster.domain.trim_end_matches('.');
        options.patches.push(arg_patch(
            &[Component::SourceController],
            &format!("--storage-adv-addr=source-controller.$(RUNTIME_NAMESPACE).svc.{domain}."),
            true,
        ));
        let senders: Vec<Component> = Component::ALL
            .iter()
            .copied()
            .filter(|c| *c != Component::NotificationController)
            .collect();
        options.patches.push(arg_patch(
            &senders,
            &format!("--events-addr=http://notification-controller.$(RUNTIME_NAMESPACE).svc.{domain}./"),
            true,
        ));
    }

    Ok(())
}

/// Exclude sharded objects from the main controllers.
///
/// The per-shard overlays are staged by the pipeline.
pub fn apply_sharding(options: &mut BuildOptions, version: &Version, sharding: &Sharding) -> Result<()> {
    if sharding.shards.is_empty() {
        return Ok(());
    }
    if !at_least(version, 2, 2, 0) {
        return Err(Error::policy("sharding is not supported in Flux versions < 2.2.0"));
    }

    let sharded: Vec<Component> = SHARDED_CONTROLLERS
        .iter()
        .copied()
        .filter(|c| options.has_component(*c))
        .collect();
    if sharded.is_empty() {
        return Err(Error::policy(
            "sharding requires at least one of source-controller, kustomize-controller or helm-controller",
        ));
    }

    options.patches.push(arg_patch(
        &sharded,
        &format!("--watch-label-selector=!{}", sharding.key),
        false,
    ));
    Ok(())
}

fn service_account_or_default(name: &Option<String>) -> &str {
    match name.as_deref() {
        Some(sa) if !sa.trim().is_empty() => sa,
        _ => DEFAULT_SERVICE_ACCOUNT,
    }
}

/// Name selector for a controller set. With `include_shards` the pattern also
/// matches the suffixed copies staged for shards.
pub fn deployment_name_pattern(components: &[Component], include_shards: bool) -> String {
    let names: Vec<&str> = components.iter().map(Component::as_str).collect();
    if include_shards {
        format!("({})(-.+)?", names.join("|"))
    } else {
        format!("({})", names.join("|"))
    }
}

/// Patch item appending one container argument to a controller set.
pub fn arg_patch(components: &[Component], arg: &str, include_shards: bool) -> String {
    let pattern = deployment_name_pattern(components, include_shards);
    format!(
        "- target:\n    kind: Deployment\n    name: {}\n  patch: |-\n    - op: add\n      path: /spec/template/spec/containers/0/args/-\n      value: {}\n",
        quote(&pattern),
        quote(arg),
    )
}

/// Drop the pinned user and seccomp profile so the restricted SCC can assign
/// them. Fields already absent are left alone.
fn openshift_patch() -> String {
    let pattern = deployment_name_pattern(&Component::ALL, true);
    format!(
        "- target:\n    kind: Deployment\n    name: {}\n  patch: |-\n    apiVersion: apps/v1\n    kind: Deployment\n    metadata:\n      name: all\n    spec:\n      template:\n        spec:\n          securityContext: null\n          containers:\n            - name: manager\n              securityContext:\n                runAsUser: null\n                seccompProfile: null\n",
        quote(&pattern),
    )
}

/// YAML double-quoted scalar (JSON string syntax is valid YAML).
fn quote(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(object_level: bool, multi_tenant: bool) -> WorkloadIdentity {
        WorkloadIdentity {
            object_level,
            multi_tenant,
            ..Default::default()
        }
    }

    #[test]
    fn test_pre_2_6_rejects_object_level() {
        let err = resolve_workload_identity(&Version::new(2, 5, 0), &identity(true, false)).unwrap_err();
        assert!(err.is_policy_violation());
        assert!(err.to_string().contains("not supported in Flux versions < 2.6.0"));
    }

    #[test]
    fn test_pre_2_6_rejects_multi_tenant() {
        let err = resolve_workload_identity(&Version::new(2, 5, 0), &identity(false, true)).unwrap_err();
        assert!(err.to_string().contains("multi-tenant"));
        assert!(err.to_string().contains("< 2.6.0"));
    }

    #[test]
    fn test_pre_2_6_disabled_emits_nothing() {
        let delta = resolve_workload_identity(&Version::new(2, 5, 0), &identity(false, false)).unwrap();
        assert!(delta.patches.is_empty());
        assert!(!delta.remove_token_permission);
    }

    #[test]
    fn test_2_6_rejects_multi_tenant() {
        let err = resolve_workload_identity(&Version::new(2, 6, 2), &identity(true, true)).unwrap_err();
        assert!(err.to_string().contains("not supported in Flux versions < 2.7.0"));
    }

    #[test]
    fn test_2_6_disabled_removes_token_permission_without_gate() {
        let delta = resolve_workload_identity(&Version::new(2, 6, 2), &identity(false, false)).unwrap();
        assert!(delta.patches.is_empty());
        assert!(delta.remove_token_permission);
    }

    #[test]
    fn test_2_6_enabled_sets_gate_on_early_subset() {
        let delta = resolve_workload_identity(&Version::new(2, 6, 0), &identity(true, false)).unwrap();
        let text = delta.patches.as_str();
        assert!(text.contains("--feature-gates=ObjectLevelWorkloadIdentity=true"));
        assert!(text.contains("image-automation-controller"));
        assert!(!text.contains("helm-controller"));
        assert!(!delta.remove_token_permission);
    }

    #[test]
    fn test_2_7_always_states_gate() {
        let delta = resolve_workload_identity(&Version::new(2, 7, 0), &identity(false, false)).unwrap();
        let text = delta.patches.as_str();
        assert!(text.contains("ObjectLevelWorkloadIdentity=false"));
        assert!(text.contains("helm-controller"));
        assert!(delta.remove_token_permission);
    }

    #[test]
    fn test_2_7_multi_tenant_requires_object_level() {
        let err = resolve_workload_identity(&Version::new(2, 7, 1), &identity(false, true)).unwrap_err();
        assert!(err.to_string().contains("requires object-level"));
    }

    #[test]
    fn test_2_7_multi_tenant_defaults() {
        let delta = resolve_workload_identity(&Version::new(2, 7, 0), &identity(true, true)).unwrap();
        let text = delta.patches.as_str();
        assert!(text.contains("ObjectLevelWorkloadIdentity=true"));
        assert!(text.contains("\"--default-service-account=default\""));
        assert!(text.contains("\"--default-decryption-service-account=default\""));
        assert!(text.contains("\"--default-kubeconfig-service-account=default\""));
        assert_eq!(text.matches("- target:").count(), 4);
        assert!(!delta.remove_token_permission);
    }

    #[test]
    fn test_2_7_multi_tenant_overrides() {
        let wi = WorkloadIdentity {
            object_level: true,
            multi_tenant: true,
            default_service_account: Some("tenant".to_string()),
            default_decryption_service_account: Some("sops".to_string()),
            default_kubeconfig_service_account: None,
        };
        let text = resolve_workload_identity(&Version::new(2, 7, 0), &wi)
            .unwrap()
            .patches
            .as_str()
            .to_string();
        assert!(text.contains("--default-service-account=tenant"));
        assert!(text.contains("--default-decryption-service-account=sops"));
        assert!(text.contains("--default-kubeconfig-service-account=default"));
    }

    #[test]
    fn test_resolver_is_deterministic() {
        let wi = identity(true, true);
        let a = resolve_workload_identity(&Version::new(2, 7, 0), &wi).unwrap();
        let b = resolve_workload_identity(&Version::new(2, 7, 0), &wi).unwrap();
        assert_eq!(a.patches.as_str().as_bytes(), b.patches.as_str().as_bytes());
    }

    #[test]
    fn test_arg_patch_is_valid_yaml() {
        let text = arg_patch(&EARLY_IDENTITY_CONTROLLERS, "--watch-label-selector=!a/b", true);
        let parsed: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
        let item = &parsed[0];
        assert_eq!(item["target"]["kind"].as_str(), Some("Deployment"));
        assert!(item["patch"].as_str().unwrap().contains("!a/b"));
    }

    #[test]
    fn test_patch_set_appends_in_order() {
        let mut set = PatchSet::new();
        set.push("- a: 1");
        set.push("");
        set.push("- b: 2\n");
        assert_eq!(set.as_str(), "- a: 1\n- b: 2\n");
    }

    #[test]
    fn test_sharding_requires_2_2() {
        let mut options = BuildOptions::new(&Version::new(2, 1, 0), vec![Component::SourceController]);
        let sharding = Sharding {
            key: "sharding.fluxcd.io/key".to_string(),
            shards: vec!["shard1".to_string()],
        };
        let err = apply_sharding(&mut options, &Version::new(2, 1, 0), &sharding).unwrap_err();
        assert!(err.to_string().contains("< 2.2.0"));
    }

    #[test]
    fn test_sharding_excludes_shard_objects_from_main_controllers() {
        let version = Version::new(2, 7, 0);
        let mut options = BuildOptions::new(
            &version,
            vec![Component::SourceController, Component::NotificationController],
        );
        let sharding = Sharding {
            key: "sharding.fluxcd.io/key".to_string(),
            shards: vec!["shard1".to_string()],
        };
        apply_sharding(&mut options, &version, &sharding).unwrap();
        let text = options.patches.as_str();
        assert!(text.contains("\"(source-controller)\""));
        assert!(text.contains("--watch-label-selector=!sharding.fluxcd.io/key"));
    }

    #[test]
    fn test_cluster_domain_patches() {
        let mut options = BuildOptions::new(&Version::new(2, 7, 0), vec![Component::SourceController]);
        let cluster = Cluster {
            domain: "example.internal".to_string(),
            ..Default::default()
        };
        apply_cluster_profile(&mut options, &cluster).unwrap();
        let text = options.patches.as_str();
        assert!(text.contains("svc.example.internal."));
        assert!(text.contains("--events-addr=http://notification-controller"));
    }

    #[test]
    fn test_default_cluster_emits_nothing() {
        let mut options = BuildOptions::new(&Version::new(2, 7, 0), vec![Component::SourceController]);
        apply_cluster_profile(&mut options, &Cluster::default()).unwrap();
        assert!(options.patches.is_empty());
    }
}
