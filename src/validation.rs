//! Configuration validation - rules produce structured violations
//!
//! Each rule inspects the configuration against the resolved version and
//! reports every problem it finds; the validator joins them into a single
//! error so the user sees all of them at once.

use std::collections::BTreeSet;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::config::{Component, DistributionConfig};
use crate::error::{Error, Result};

/// Malformed values are input errors; well-formed values the resolved
/// version or the rest of the configuration does not allow are policy
/// violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationKind {
    Malformed,
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub rule: String,
    pub kind: ViolationKind,
    pub message: String,
    pub actual: Option<String>,
}

impl ValidationViolation {
    fn malformed(rule: &str, message: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::new(rule, ViolationKind::Malformed, message, actual)
    }

    fn unsupported(rule: &str, message: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::new(rule, ViolationKind::Unsupported, message, actual)
    }

    fn new(rule: &str, kind: ViolationKind, message: impl Into<String>, actual: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            kind,
            message: message.into(),
            actual: Some(actual.into()),
        }
    }
}

/// Validation rule trait - produces violations
pub trait ValidationRule {
    fn name(&self) -> &'static str;
    fn validate(&self, config: &DistributionConfig, version: &Version) -> Vec<ValidationViolation>;
}

// --- Concrete Rules ---

/// Selected components must be a non-empty subset of the catalog, each
/// available in the resolved version.
pub struct ComponentRule;

impl ValidationRule for ComponentRule {
    fn name(&self) -> &'static str { "components" }

    fn validate(&self, config: &DistributionConfig, version: &Version) -> Vec<ValidationViolation> {
        if config.components.is_empty() {
            return vec![ValidationViolation::malformed(
                self.name(),
                "at least one component must be selected",
                "[]",
            )];
        }

        let mut violations = vec![];
        for name in &config.components {
            match name.parse::<Component>() {
                Ok(component) if !component.available_in(version) => {
                    let min = component
                        .min_version()
                        .map(|v| v.to_string())
                        .unwrap_or_default();
                    violations.push(ValidationViolation::unsupported(
                        self.name(),
                        format!("{component} requires Flux version >= {min}"),
                        format!("v{version}"),
                    ));
                }
                Ok(_) => {}
                Err(_) => violations.push(ValidationViolation::malformed(
                    self.name(),
                    "unknown component",
                    name.as_str(),
                )),
            }
        }
        violations
    }
}

pub struct NamespaceRule;

impl ValidationRule for NamespaceRule {
    fn name(&self) -> &'static str { "namespace" }

    fn validate(&self, config: &DistributionConfig, _version: &Version) -> Vec<ValidationViolation> {
        if is_dns_label(&config.namespace) {
            vec![]
        } else {
            vec![ValidationViolation::malformed(
                self.name(),
                "namespace must be a DNS-1123 label",
                config.namespace.as_str(),
            )]
        }
    }
}

pub struct ShardRule;

impl ValidationRule for ShardRule {
    fn name(&self) -> &'static str { "sharding" }

    fn validate(&self, config: &DistributionConfig, _version: &Version) -> Vec<ValidationViolation> {
        let Some(sharding) = &config.sharding else {
            return vec![];
        };

        let mut violations = vec![];
        if sharding.key.trim().is_empty() {
            violations.push(ValidationViolation::malformed(self.name(), "sharding key must not be empty", ""));
        }
        let mut seen = BTreeSet::new();
        for shard in &sharding.shards {
            if !is_dns_label(shard) {
                violations.push(ValidationViolation::malformed(
                    self.name(),
                    "shard name must be a DNS-1123 label",
                    shard.as_str(),
                ));
            }
            if !seen.insert(shard.as_str()) {
                violations.push(ValidationViolation::malformed(
                    self.name(),
                    "duplicate shard name",
                    shard.as_str(),
                ));
            }
        }
        violations
    }
}

pub struct StorageRule;

impl ValidationRule for StorageRule {
    fn name(&self) -> &'static str { "storage" }

    fn validate(&self, config: &DistributionConfig, _version: &Version) -> Vec<ValidationViolation> {
        match &config.storage {
            Some(storage) if storage.size.trim().is_empty() => vec![ValidationViolation::malformed(
                self.name(),
                "storage size must be set",
                "",
            )],
            Some(_) if !config.components.iter().any(|c| c == Component::SourceController.as_str()) => {
                vec![ValidationViolation::unsupported(
                    self.name(),
                    "persistent storage requires source-controller",
                    "",
                )]
            }
            _ => vec![],
        }
    }
}

/// Validator runs every rule and reports all violations together
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(ComponentRule),
                Box::new(NamespaceRule),
                Box::new(ShardRule),
                Box::new(StorageRule),
            ],
        }
    }

    pub fn validate(&self, config: &DistributionConfig, version: &Version) -> Vec<ValidationViolation> {
        self.rules
            .iter()
            .flat_map(|rule| rule.validate(config, version))
            .collect()
    }

    pub fn check(&self, config: &DistributionConfig, version: &Version) -> Result<()> {
        let violations = self.validate(config, version);
        if violations.is_empty() {
            return Ok(());
        }
        let messages: Vec<_> = violations
            .iter()
            .map(|v| match &v.actual {
                Some(actual) if !actual.is_empty() => format!("{}: {} ({})", v.rule, v.message, actual),
                _ => format!("{}: {}", v.rule, v.message),
            })
            .collect();
        let message = messages.join("; ");
        if violations.iter().any(|v| v.kind == ViolationKind::Malformed) {
            Err(Error::Config(message))
        } else {
            Err(Error::Validation(message))
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

/// RFC 1123 label: lowercase alphanumerics and '-', 1-63 chars, alphanumeric at both ends.
pub fn is_dns_label(value: &str) -> bool {
    let bytes = value.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes.iter().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0] != b'-'
        && bytes[bytes.len() - 1] != b'-'
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Sharding, Storage};

    fn v(major: u64, minor: u64) -> Version {
        Version::new(major, minor, 0)
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Validator::new().check(&DistributionConfig::default(), &v(2, 7)).is_ok());
    }

    #[test]
    fn test_empty_components_rejected() {
        let config = DistributionConfig {
            components: vec![],
            ..Default::default()
        };
        let err = Validator::new().check(&config, &v(2, 7)).unwrap_err();
        assert!(err.to_string().contains("at least one component"));
    }

    #[test]
    fn test_unknown_component_reported() {
        let config = DistributionConfig {
            components: vec!["source-controller".to_string(), "flagger".to_string()],
            ..Default::default()
        };
        let violations = Validator::new().validate(&config, &v(2, 7));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].actual.as_deref(), Some("flagger"));
    }

    #[test]
    fn test_component_min_version() {
        let config = DistributionConfig {
            components: vec!["source-watcher".to_string()],
            ..Default::default()
        };
        let err = Validator::new().check(&config, &v(2, 6)).unwrap_err();
        assert!(err.is_policy_violation());
        assert!(err.to_string().contains("source-watcher requires Flux version >= 2.7.0"));
        assert!(Validator::new().check(&config, &v(2, 7)).is_ok());
    }

    #[test]
    fn test_all_violations_collected() {
        let config = DistributionConfig {
            namespace: "Flux_System".to_string(),
            sharding: Some(Sharding {
                key: "sharding.fluxcd.io/key".to_string(),
                shards: vec!["a".to_string(), "a".to_string()],
            }),
            ..Default::default()
        };
        let violations = Validator::new().validate(&config, &v(2, 7));
        let rules: Vec<_> = violations.iter().map(|v| v.rule.as_str()).collect();
        assert_eq!(rules, vec!["namespace", "sharding"]);
    }

    #[test]
    fn test_malformed_values_are_input_errors() {
        let config = DistributionConfig {
            namespace: "Flux_System".to_string(),
            ..Default::default()
        };
        let err = Validator::new().check(&config, &v(2, 7)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.is_input_error());
        assert!(!err.is_policy_violation());

        let config = DistributionConfig {
            sharding: Some(Sharding {
                key: String::new(),
                shards: vec!["a".to_string(), "a".to_string()],
            }),
            ..Default::default()
        };
        let violations = Validator::new().validate(&config, &v(2, 7));
        assert_eq!(violations.len(), 2);
        assert!(violations.iter().all(|v| v.kind == ViolationKind::Malformed));
        assert!(Validator::new().check(&config, &v(2, 7)).unwrap_err().is_input_error());
    }

    #[test]
    fn test_malformed_wins_over_policy() {
        let config = DistributionConfig {
            namespace: "Flux_System".to_string(),
            components: vec!["source-watcher".to_string()],
            ..Default::default()
        };
        let err = Validator::new().check(&config, &v(2, 6)).unwrap_err();
        assert!(err.is_input_error());
        let message = err.to_string();
        assert!(message.contains("namespace"));
        assert!(message.contains("source-watcher"));
    }

    #[test]
    fn test_storage_requires_source_controller() {
        let config = DistributionConfig {
            components: vec!["helm-controller".to_string()],
            storage: Some(Storage {
                class: "standard".to_string(),
                size: "10Gi".to_string(),
            }),
            ..Default::default()
        };
        let err = Validator::new().check(&config, &v(2, 7)).unwrap_err();
        assert!(err.is_policy_violation());
        assert!(err.to_string().contains("requires source-controller"));
    }

    #[test]
    fn test_dns_label() {
        assert!(is_dns_label("flux-system"));
        assert!(is_dns_label("shard1"));
        assert!(!is_dns_label("-shard"));
        assert!(!is_dns_label("Shard"));
        assert!(!is_dns_label(""));
        assert!(!is_dns_label(&"a".repeat(64)));
    }
}
