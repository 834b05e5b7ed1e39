//! Resource templates - render objects against fact-sets
//!
//! Templates use minijinja with non-default delimiters so they never clash
//! with the `{{ }}` expressions Helm charts and controllers carry in their own
//! manifests:
//! - variables: `<< inputs.name >>`
//! - blocks: `<% if inputs.enabled %> ... <% endif %>`
//! - comments: `<# ... #>`
//!
//! The fact-set is bound under the single name `inputs`. Undefined references
//! are errors.

use base64::{engine::general_purpose::STANDARD, Engine};
use minijinja::syntax::SyntaxConfig;
use minijinja::{context, Environment, ErrorKind, UndefinedBehavior};
use serde_json::Value;
use thiserror::Error;

use crate::error::{Error, Result};
use crate::inputs::FactSet;
use crate::resources::{parse_yaml_documents, InvalidResource, Resource, ResourceSet};

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template syntax error: {0}")]
    Parse(String),

    #[error("template render error: {0}")]
    Render(#[from] minijinja::Error),

    #[error("rendered output is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Resource(#[from] InvalidResource),
}

/// Settings of the `slugify` filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlugOptions {
    pub max_length: usize,
    /// Cut at the last word boundary that fits instead of mid-word.
    pub word_safe: bool,
}

impl Default for SlugOptions {
    fn default() -> Self {
        Self {
            max_length: 63,
            word_safe: true,
        }
    }
}

pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    pub fn new(slug: SlugOptions) -> std::result::Result<Self, TemplateError> {
        let syntax = SyntaxConfig::builder()
            .variable_delimiters("<<", ">>")
            .block_delimiters("<%", "%>")
            .comment_delimiters("<#", "#>")
            .build()
            .map_err(|e| TemplateError::Parse(e.to_string()))?;

        let mut env = Environment::new();
        env.set_syntax(syntax);
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);

        env.add_filter("slugify", move |value: &str| slugify(value, &slug));
        env.add_filter("to_yaml", to_yaml);
        env.add_filter("quote", quote);
        env.add_filter("b64encode", b64encode);
        env.add_filter("b64decode", b64decode);

        Ok(Self { env })
    }

    /// Render template text with `inputs` bound.
    pub fn render_str(&self, template: &str, inputs: &FactSet) -> std::result::Result<String, TemplateError> {
        Ok(self.env.render_str(template, context! { inputs => inputs })?)
    }

    /// Render one object template against one fact-set.
    pub fn render_resource(
        &self,
        template: &Value,
        inputs: &FactSet,
    ) -> std::result::Result<Resource, TemplateError> {
        let source = serde_yaml::to_string(template)?;
        let rendered = self.render_str(&source, inputs)?;
        let value: Value = serde_yaml::from_str(&rendered)?;
        Ok(Resource::try_from(value)?)
    }

    /// Render every template once per fact-set, or once with empty inputs
    /// when there are none. Excluded objects and later duplicates are dropped.
    pub fn render_resource_set(&self, templates: &[Value], fact_sets: &[FactSet]) -> Result<Vec<Resource>> {
        let empty = [FactSet::new()];
        let bindings = if fact_sets.is_empty() { &empty[..] } else { fact_sets };

        let mut acc = ResourceSet::new();
        for (t, template) in templates.iter().enumerate() {
            for (i, inputs) in bindings.iter().enumerate() {
                let resource = self
                    .render_resource(template, inputs)
                    .map_err(|source| Error::Render {
                        template: t,
                        input: (!fact_sets.is_empty()).then_some(i),
                        source,
                    })?;
                acc.insert(resource);
            }
        }
        Ok(acc.into_resources())
    }

    /// Render a multi-document text template per fact-set into `acc`.
    ///
    /// `index` names the template in errors.
    pub fn render_document_set(
        &self,
        index: usize,
        text: &str,
        fact_sets: &[FactSet],
        acc: &mut ResourceSet,
    ) -> Result<()> {
        let empty = [FactSet::new()];
        let bindings = if fact_sets.is_empty() { &empty[..] } else { fact_sets };

        for (i, inputs) in bindings.iter().enumerate() {
            let wrap = |source: TemplateError| Error::Render {
                template: index,
                input: (!fact_sets.is_empty()).then_some(i),
                source,
            };
            let rendered = self.render_str(text, inputs).map_err(wrap)?;
            let documents = parse_yaml_documents(&rendered).map_err(|e| wrap(e.into()))?;
            for document in documents {
                let resource = Resource::try_from(document).map_err(|e| wrap(e.into()))?;
                acc.insert(resource);
            }
        }
        Ok(())
    }
}

/// Lowercase, collapse non-alphanumeric runs into `-`, bound the length.
pub fn slugify(value: &str, options: &SlugOptions) -> String {
    let mut slug = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.len() <= options.max_length {
        return slug.to_string();
    }

    let cut = &slug[..options.max_length];
    let cut = if options.word_safe {
        match cut.rfind('-') {
            Some(i) if i > 0 && slug.as_bytes()[options.max_length] != b'-' => &cut[..i],
            _ => cut,
        }
    } else {
        cut
    };
    cut.trim_end_matches('-').to_string()
}

fn filter_error(msg: String) -> minijinja::Error {
    minijinja::Error::new(ErrorKind::InvalidOperation, msg)
}

fn to_yaml(value: minijinja::Value) -> std::result::Result<String, minijinja::Error> {
    serde_yaml::to_string(&value)
        .map(|s| s.trim_end().to_string())
        .map_err(|e| filter_error(format!("to_yaml: {e}")))
}

/// Double-quoted scalar, valid in both YAML and JSON.
fn quote(value: minijinja::Value) -> String {
    let text = match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    };
    Value::String(text).to_string()
}

fn b64encode(value: &str) -> String {
    STANDARD.encode(value.as_bytes())
}

fn b64decode(value: &str) -> std::result::Result<String, minijinja::Error> {
    let bytes = STANDARD
        .decode(value)
        .map_err(|e| filter_error(format!("b64decode: {e}")))?;
    String::from_utf8(bytes).map_err(|e| filter_error(format!("b64decode: invalid UTF-8: {e}")))
}
