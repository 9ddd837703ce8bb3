//! # Dimension Space
//!
//! Content can vary along configured *dimensions* such as `language` or
//! `market`. Each dimension declares a set of values, a default, and
//! generalization edges between values that form a DAG:
//!
//! ```text
//! language:   en            (default, depth 0)
//!            /  \
//!         de      fr        (generalize to en, depth 1)
//!         |
//!       de_ch               (generalizes to de, depth 2)
//! ```
//!
//! A [`DimensionSpacePoint`] picks one value per dimension. The
//! [`InterDimensionalVariationGraph`] combines all dimensions and answers
//! which points specialize or generalize which, and which variant a node
//! falls back to when it does not exist in the requested point.
//!
//! ## Module Layout
//!
//! - [`point`]: dimension space points and point sets
//! - [`weight`]: variation weights and their (partial) ordering
//! - [`variation`]: the inter-dimensional variation graph

pub mod point;
pub mod variation;
pub mod weight;

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use point::{DimensionSpacePoint, DimensionSpacePointSet};
pub use variation::{InterDimensionalVariationGraph, VariantType};
pub use weight::ContentSubgraphVariationWeight;

string_id!(
    /// Identifies a content dimension, e.g. `language`.
    ContentDimensionId,
    |v| !v.is_empty() && v.len() <= 64 && !v.chars().any(char::is_whitespace)
);

// =============================================================================
// Configuration
// =============================================================================

/// One declared value of a dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDimensionValueConfig {
    /// The value, e.g. `de`
    pub value: String,
    /// Values this one falls back to, e.g. `["en"]`
    #[serde(default)]
    pub generalizations: Vec<String>,
}

/// Configuration of a single dimension, as found in the repository config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDimensionConfig {
    /// The dimension id
    pub id: ContentDimensionId,
    /// Declared values in configured order
    pub values: Vec<ContentDimensionValueConfig>,
    /// The value used by the default dimension space point
    pub default: String,
}

impl ContentDimensionConfig {
    /// Builds a configuration from `(value, generalizations)` pairs.
    pub fn new(
        id: ContentDimensionId,
        default: impl Into<String>,
        values: &[(&str, &[&str])],
    ) -> Self {
        Self {
            id,
            default: default.into(),
            values: values
                .iter()
                .map(|(value, generalizations)| ContentDimensionValueConfig {
                    value: value.to_string(),
                    generalizations: generalizations.iter().map(|g| g.to_string()).collect(),
                })
                .collect(),
        }
    }
}

// =============================================================================
// Validated Dimension
// =============================================================================

#[derive(Debug, Clone)]
struct DimensionValue {
    generalizations: Vec<String>,
    specializations: Vec<String>,
    depth: u32,
}

/// A validated content dimension with precomputed value depths.
///
/// # Invariants
///
/// - The generalization edges form a DAG (no value generalizes to itself,
///   directly or transitively)
/// - Every referenced value is declared
/// - The depth of a value is 0 if it has no generalizations, otherwise one
///   more than the deepest of its generalizations
#[derive(Debug, Clone)]
pub struct ContentDimension {
    id: ContentDimensionId,
    values: IndexMap<String, DimensionValue>,
    default: String,
    max_depth: u32,
}

impl ContentDimension {
    /// Validates a dimension configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDimensionConfiguration`] for duplicate or
    /// undeclared values, an undeclared default, or a generalization cycle.
    pub fn from_config(config: &ContentDimensionConfig) -> Result<Self> {
        let invalid = |message: String| {
            Error::InvalidDimensionConfiguration(format!("dimension '{}': {}", config.id, message))
        };

        if config.values.is_empty() {
            return Err(invalid("no values declared".to_string()));
        }

        let mut values: IndexMap<String, DimensionValue> = IndexMap::new();
        for value in &config.values {
            if value.value.is_empty() {
                return Err(invalid("empty value".to_string()));
            }
            let previous = values.insert(
                value.value.clone(),
                DimensionValue {
                    generalizations: value.generalizations.clone(),
                    specializations: Vec::new(),
                    depth: 0,
                },
            );
            if previous.is_some() {
                return Err(invalid(format!("value '{}' declared twice", value.value)));
            }
        }

        if !values.contains_key(&config.default) {
            return Err(invalid(format!("default value '{}' is not declared", config.default)));
        }

        let mut edges = Vec::new();
        for (value, declared) in &values {
            for generalization in &declared.generalizations {
                if !values.contains_key(generalization) {
                    return Err(invalid(format!(
                        "value '{value}' generalizes to undeclared value '{generalization}'"
                    )));
                }
                edges.push((generalization.clone(), value.clone()));
            }
        }
        for (generalization, specialization) in edges {
            if let Some(entry) = values.get_mut(&generalization) {
                entry.specializations.push(specialization);
            }
        }

        // Depth-first over generalization edges; a value on the current path
        // seen again is a cycle.
        let mut depths: HashMap<String, u32> = HashMap::new();
        for value in values.keys() {
            let mut path = HashSet::new();
            compute_depth(value, &values, &mut depths, &mut path).map_err(&invalid)?;
        }

        let mut max_depth = 0;
        for (value, entry) in values.iter_mut() {
            entry.depth = depths.get(value).copied().unwrap_or(0);
            max_depth = max_depth.max(entry.depth);
        }

        Ok(Self {
            id: config.id.clone(),
            values,
            default: config.default.clone(),
            max_depth,
        })
    }

    /// Returns the dimension id.
    pub fn id(&self) -> &ContentDimensionId {
        &self.id
    }

    /// Returns the default value.
    pub fn default_value(&self) -> &str {
        &self.default
    }

    /// Returns all values in configured order.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Returns true if the value is declared.
    pub fn contains(&self, value: &str) -> bool {
        self.values.contains_key(value)
    }

    /// Returns the specialization depth of a value.
    pub fn depth(&self, value: &str) -> Option<u32> {
        self.values.get(value).map(|v| v.depth)
    }

    /// Returns the deepest specialization depth of this dimension.
    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Returns the direct generalizations of a value.
    pub fn generalizations(&self, value: &str) -> &[String] {
        self.values
            .get(value)
            .map(|v| v.generalizations.as_slice())
            .unwrap_or(&[])
    }

    /// Returns the direct specializations of a value.
    pub fn specializations(&self, value: &str) -> &[String] {
        self.values
            .get(value)
            .map(|v| v.specializations.as_slice())
            .unwrap_or(&[])
    }

    /// Returns the value and all its transitive specializations.
    pub fn specialization_closure(&self, value: &str) -> Vec<String> {
        let mut result = vec![value.to_string()];
        let mut index = 0;
        while index < result.len() {
            let current = result[index].clone();
            for specialization in self.specializations(&current) {
                if !result.contains(specialization) {
                    result.push(specialization.clone());
                }
            }
            index += 1;
        }
        result
    }
}

fn compute_depth(
    value: &str,
    values: &IndexMap<String, DimensionValue>,
    depths: &mut HashMap<String, u32>,
    path: &mut HashSet<String>,
) -> std::result::Result<u32, String> {
    if let Some(depth) = depths.get(value) {
        return Ok(*depth);
    }
    if !path.insert(value.to_string()) {
        return Err(format!("generalization cycle through value '{value}'"));
    }

    let mut depth = 0;
    if let Some(entry) = values.get(value) {
        for generalization in &entry.generalizations {
            depth = depth.max(compute_depth(generalization, values, depths, path)? + 1);
        }
    }

    path.remove(value);
    depths.insert(value.to_string(), depth);
    Ok(depth)
}

// =============================================================================
// Tests
// =============================================================================
