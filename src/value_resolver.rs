//! Lookup-and-fallback for configured scalars.
//!
//! Every tariff field goes through the same ordered source list: a live helper
//! entity first, then the statically configured number, then a hard default.
//! Resolution never fails; a broken helper just falls through.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// States a helper entity reports when it has no usable value
const UNAVAILABLE_STATES: [&str; 2] = ["unknown", "unavailable"];

/// Result of looking up a helper entity
#[derive(Debug, Clone, PartialEq)]
pub enum HelperState {
    /// Raw state string as reported by the host
    Value(String),
    /// The entity exists but reports `unknown` / `unavailable`
    Unavailable,
    /// No such entity
    NotFound,
}

impl HelperState {
    /// Classifies a raw state string
    pub fn from_raw(state: &str) -> Self {
        let trimmed = state.trim();
        if UNAVAILABLE_STATES.contains(&trimmed) {
            HelperState::Unavailable
        } else {
            HelperState::Value(trimmed.to_string())
        }
    }

    /// Numeric value, if there is one
    pub fn as_number(&self) -> Option<f64> {
        match self {
            HelperState::Value(raw) => raw.trim().parse::<f64>().ok(),
            HelperState::Unavailable | HelperState::NotFound => None,
        }
    }
}

/// Anything that can answer "what is the current state of entity X"
pub trait HelperLookup: Send + Sync {
    fn helper_state(&self, entity_id: &str) -> HelperState;
}

/// Lookup used when no helper backend is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHelpers;

impl HelperLookup for NoHelpers {
    fn helper_state(&self, _entity_id: &str) -> HelperState {
        HelperState::NotFound
    }
}

/// One candidate in a resolution chain
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueSource<'a> {
    Helper(&'a str),
    Static(f64),
    Default(f64),
}

/// Returns the first source in `sources` that yields a number
pub fn resolve_sources(lookup: &dyn HelperLookup, sources: &[ValueSource<'_>]) -> Option<f64> {
    sources.iter().find_map(|source| match *source {
        ValueSource::Helper(entity_id) => helper_value(lookup, entity_id),
        ValueSource::Static(value) | ValueSource::Default(value) => Some(value),
    })
}

/// helper → static → default
pub fn resolve(
    lookup: &dyn HelperLookup,
    helper_ref: Option<&str>,
    static_value: Option<f64>,
    default: f64,
) -> f64 {
    let mut sources = Vec::with_capacity(3);
    if let Some(entity_id) = helper_ref.filter(|id| !id.trim().is_empty()) {
        sources.push(ValueSource::Helper(entity_id));
    }
    if let Some(value) = static_value {
        sources.push(ValueSource::Static(value));
    }
    sources.push(ValueSource::Default(default));

    resolve_sources(lookup, &sources).unwrap_or(default)
}

fn helper_value(lookup: &dyn HelperLookup, entity_id: &str) -> Option<f64> {
    let state = lookup.helper_state(entity_id);
    let value = state.as_number();
    if value.is_none() {
        debug!("Helper {entity_id} has no usable value ({state:?}), falling back");
    }
    value
}

/// A configured number that may be shadowed by a helper entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfiguredValue {
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub helper: Option<String>,
}

impl ConfiguredValue {
    pub fn fixed(value: f64) -> Self {
        Self {
            value: Some(value),
            helper: None,
        }
    }

    pub fn with_helper(mut self, entity_id: &str) -> Self {
        self.helper = Some(entity_id.to_string());
        self
    }

    pub fn resolve(&self, lookup: &dyn HelperLookup, default: f64) -> f64 {
        resolve(lookup, self.helper.as_deref(), self.value, default)
    }
}
