//! Error taxonomy for a compilation.
//!
//! Every variant aborts the current compilation; there is no degraded result.

use std::path::PathBuf;

use thiserror::Error;

use crate::overlay::OverlayError;
use crate::templates::TemplateError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    // --- input errors ---
    #[error("invalid version '{raw}': {source}")]
    InvalidVersion {
        raw: String,
        #[source]
        source: semver::Error,
    },

    #[error("invalid version range '{raw}': {source}")]
    InvalidVersionRange {
        raw: String,
        #[source]
        source: semver::Error,
    },

    #[error("no distribution version matching '{0}' found in {1}")]
    VersionNotFound(String, PathBuf),

    #[error("unknown component '{0}'")]
    UnknownComponent(String),

    #[error("unknown registry '{0}', the registry variant must be set explicitly")]
    UnknownRegistry(String),

    #[error("unknown registry variant '{0}'")]
    UnknownRegistryVariant(String),

    #[error("unknown input strategy '{0}', expected one of: Flatten, Permute")]
    UnknownStrategy(String),

    #[error("input provider name '{0}' normalizes to an empty key")]
    EmptyProviderName(String),

    #[error("input provider '{name}' collides with an existing provider on key '{key}'")]
    DuplicateProvider { name: String, key: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    // --- policy violations ---
    #[error("{0}")]
    Policy(String),

    #[error("validation failed: {0}")]
    Validation(String),

    // --- combinatorial limit ---
    #[error("input provider '{provider}' would produce {count} permutations, the maximum is {max}")]
    PermutationLimit {
        provider: String,
        count: usize,
        max: usize,
    },

    #[error("inputs have already been combined, no more providers can be added")]
    InputsFinalized,

    // --- rendering ---
    #[error("failed to render template[{template}]{}: {source}", input_suffix(.input))]
    Render {
        template: usize,
        input: Option<usize>,
        #[source]
        source: TemplateError,
    },

    // --- overlay engine ---
    #[error("overlay build failed: {0}")]
    Overlay(#[from] OverlayError),

    #[error("image lookup failed: {0}")]
    ImageLookup(String),

    // --- codecs and files ---
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

fn input_suffix(input: &Option<usize>) -> String {
    match input {
        Some(index) => format!(" with inputs[{index}]"),
        None => String::new(),
    }
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn policy(rule: impl Into<String>) -> Self {
        Self::Policy(rule.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Input errors are caused by malformed values rather than disallowed
    /// combinations of valid ones.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidVersion { .. }
                | Self::InvalidVersionRange { .. }
                | Self::VersionNotFound(..)
                | Self::UnknownComponent(_)
                | Self::UnknownRegistry(_)
                | Self::UnknownRegistryVariant(_)
                | Self::UnknownStrategy(_)
                | Self::EmptyProviderName(_)
                | Self::DuplicateProvider { .. }
                | Self::Config(_)
        )
    }

    pub fn is_policy_violation(&self) -> bool {
        matches!(self, Self::Policy(_) | Self::Validation(_))
    }
}
