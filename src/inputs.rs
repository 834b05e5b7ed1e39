//! Input combination - turn named lists of fact-sets into render bindings
//!
//! Two strategies share the [`Combiner`] trait:
//! - [`Flatten`] concatenates every provider's fact-sets
//! - [`Permute`] builds the cross-product, scoping each provider's facts
//!   under its normalized name
//!
//! Every combined set carries a synthetic `id` naming the provider indices it
//! was built from. Combiners are single-use: once combined, adding providers
//! is rejected.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Facts contributed by one provider entry.
pub type FactSet = Map<String, Value>;

/// Upper bound on the number of sets a cross-product may produce.
pub const MAX_PERMUTATIONS: usize = 10_000;

/// Key of the synthetic identity added to every combined set.
pub const ID_KEY: &str = "id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputStrategy {
    Flatten,
    Permute,
}

impl fmt::Display for InputStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputStrategy::Flatten => f.write_str("Flatten"),
            InputStrategy::Permute => f.write_str("Permute"),
        }
    }
}

impl FromStr for InputStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Flatten" => Ok(InputStrategy::Flatten),
            "Permute" => Ok(InputStrategy::Permute),
            other => Err(Error::UnknownStrategy(other.to_string())),
        }
    }
}

/// A named list of fact-sets, as read from an inputs file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputProvider {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<FactSet>,
}

pub trait Combiner {
    fn add_provider(&mut self, name: &str, fact_sets: Vec<FactSet>) -> Result<()>;

    /// Combined sets in deterministic order. Calling it again returns the
    /// same result.
    fn combine(&mut self) -> Result<Vec<FactSet>>;
}

/// Combiner for `strategy` with default options.
pub fn combiner(strategy: InputStrategy) -> Box<dyn Combiner> {
    match strategy {
        InputStrategy::Flatten => Box::new(Flatten::new()),
        InputStrategy::Permute => Box::new(Permute::new(PermuteOptions::default())),
    }
}

/// Combine `providers` with `strategy`.
pub fn combine_providers(strategy: InputStrategy, providers: &[InputProvider]) -> Result<Vec<FactSet>> {
    let mut combiner = combiner(strategy);
    for provider in providers {
        combiner.add_provider(&provider.name, provider.inputs.clone())?;
    }
    combiner.combine()
}

/// Template-safe key for a provider name: every character outside
/// `[A-Za-z0-9_]` becomes `_`, surrounding `_` are trimmed.
pub fn normalize_key(name: &str) -> Result<String> {
    let replaced: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    let key = replaced.trim_matches('_');
    if key.is_empty() {
        return Err(Error::EmptyProviderName(name.to_string()));
    }
    Ok(key.to_string())
}

#[derive(Debug, Clone)]
struct Provider {
    key: String,
    fact_sets: Vec<FactSet>,
}

/// Normalize `name` and make sure it does not collide with a known provider.
fn register_key(providers: &[Provider], name: &str) -> Result<String> {
    let key = normalize_key(name)?;
    if key == ID_KEY {
        return Err(Error::config(format!(
            "input provider '{name}' uses the reserved key '{ID_KEY}'"
        )));
    }
    if providers.iter().any(|p| p.key == key) {
        return Err(Error::DuplicateProvider {
            name: name.to_string(),
            key,
        });
    }
    Ok(key)
}

fn identity(key: &str, index: usize) -> String {
    format!("{key}={index}")
}

// --- Flatten ---

#[derive(Debug, Default)]
pub struct Flatten {
    providers: Vec<Provider>,
    combined: Option<Vec<FactSet>>,
}

impl Flatten {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Combiner for Flatten {
    fn add_provider(&mut self, name: &str, fact_sets: Vec<FactSet>) -> Result<()> {
        if self.combined.is_some() {
            return Err(Error::InputsFinalized);
        }
        let key = register_key(&self.providers, name)?;
        self.providers.push(Provider { key, fact_sets });
        Ok(())
    }

    fn combine(&mut self) -> Result<Vec<FactSet>> {
        if let Some(combined) = &self.combined {
            return Ok(combined.clone());
        }
        let mut combined = vec![];
        for provider in &self.providers {
            for (i, facts) in provider.fact_sets.iter().enumerate() {
                let mut set = facts.clone();
                set.insert(ID_KEY.to_string(), Value::String(identity(&provider.key, i)));
                combined.push(set);
            }
        }
        self.combined = Some(combined.clone());
        Ok(combined)
    }
}

// --- Permute ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermuteOptions {
    /// Treat a provider without fact-sets as contributing one empty set
    /// instead of emptying the whole product.
    pub include_empty_providers: bool,
    pub max_permutations: usize,
}

impl Default for PermuteOptions {
    fn default() -> Self {
        Self {
            include_empty_providers: false,
            max_permutations: MAX_PERMUTATIONS,
        }
    }
}

#[derive(Debug, Default)]
pub struct Permute {
    options: PermuteOptions,
    providers: Vec<Provider>,
    /// Running product of the effective provider sizes.
    count: usize,
    short_circuited: bool,
    combined: Option<Vec<FactSet>>,
}

impl Permute {
    pub fn new(options: PermuteOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    /// Number of sets `combine` will produce.
    pub fn len(&self) -> usize {
        if self.providers.is_empty() || self.short_circuited {
            0
        } else {
            self.count
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lazily enumerate the cross-product without collecting it.
    pub fn permutations(&self) -> Permutations<'_> {
        Permutations::new(&self.providers, self.is_empty())
    }
}

impl Combiner for Permute {
    fn add_provider(&mut self, name: &str, mut fact_sets: Vec<FactSet>) -> Result<()> {
        if self.combined.is_some() {
            return Err(Error::InputsFinalized);
        }
        let key = register_key(&self.providers, name)?;

        if fact_sets.is_empty() {
            if self.options.include_empty_providers {
                fact_sets.push(FactSet::new());
            } else {
                self.short_circuited = true;
            }
        }

        let size = fact_sets.len();
        let count = if self.providers.is_empty() {
            size
        } else {
            self.count.saturating_mul(size)
        };
        if count > self.options.max_permutations {
            return Err(Error::PermutationLimit {
                provider: name.to_string(),
                count,
                max: self.options.max_permutations,
            });
        }

        self.count = count;
        self.providers.push(Provider { key, fact_sets });
        Ok(())
    }

    fn combine(&mut self) -> Result<Vec<FactSet>> {
        if let Some(combined) = &self.combined {
            return Ok(combined.clone());
        }
        let combined: Vec<FactSet> = self.permutations().collect();
        self.combined = Some(combined.clone());
        Ok(combined)
    }
}

/// Backtracking enumeration of the cross-product.
///
/// `selected[i]` is the fact-set index chosen for provider `i`, `-1` when
/// none is chosen yet. The cursor moves forward while providers still need a
/// selection and back when one runs out of candidates. State is O(providers).
pub struct Permutations<'a> {
    providers: &'a [Provider],
    selected: Vec<isize>,
    cursor: usize,
    done: bool,
}

impl<'a> Permutations<'a> {
    fn new(providers: &'a [Provider], empty: bool) -> Self {
        Self {
            providers,
            selected: vec![-1; providers.len()],
            cursor: 0,
            done: empty,
        }
    }

    fn emit(&self) -> FactSet {
        let mut set = FactSet::new();
        let mut ids = Vec::with_capacity(self.providers.len());
        for (provider, &index) in self.providers.iter().zip(&self.selected) {
            let index = index as usize;
            set.insert(
                provider.key.clone(),
                Value::Object(provider.fact_sets[index].clone()),
            );
            ids.push(identity(&provider.key, index));
        }
        set.insert(ID_KEY.to_string(), Value::String(ids.join(",")));
        set
    }
}

impl Iterator for Permutations<'_> {
    type Item = FactSet;

    fn next(&mut self) -> Option<FactSet> {
        if self.done {
            return None;
        }
        loop {
            let candidates = self.providers[self.cursor].fact_sets.len() as isize;
            self.selected[self.cursor] += 1;

            if self.selected[self.cursor] >= candidates {
                self.selected[self.cursor] = -1;
                if self.cursor == 0 {
                    self.done = true;
                    return None;
                }
                self.cursor -= 1;
                continue;
            }

            if self.cursor + 1 < self.providers.len() {
                self.cursor += 1;
                continue;
            }

            return Some(self.emit());
        }
    }
}
