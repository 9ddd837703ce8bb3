//! # Inter-Dimensional Variation Graph
//!
//! Combines all configured dimensions into the *allowed dimension subspace*
//! (the cartesian product of their values) and precomputes, for every point,
//! which points it specializes and generalizes.
//!
//! ## Algorithm
//!
//! A point `q` specializes a point `p` when `q != p` and, in every dimension,
//! `q`'s value is `p`'s value or one of its transitive specializations:
//!
//! ```text
//! dimensions: language (en <- de <- de_ch), market (eu <- ch)
//!
//! {en, eu} is generalized by nothing
//! {de, eu} specializes {en, eu}
//! {de, ch} specializes {en, eu}, {de, eu}, {en, ch}
//! ```
//!
//! Variants are ordered by the difference of their normalized weights, so the
//! closest generalization comes first. That one is the *primary
//! generalization*, the first fallback candidate of a point. Ties are broken
//! by point hash, which keeps the order deterministic across processes.

use std::collections::{HashMap, HashSet};

use crate::dimension::{
    ContentDimension, ContentDimensionConfig, ContentSubgraphVariationWeight, DimensionSpacePoint,
    DimensionSpacePointSet,
};
use crate::error::{Error, Result};

/// How one dimension space point relates to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariantType {
    /// Both points are equal
    Same,
    /// The subject is a specialization of the object
    Specialization,
    /// The subject is a generalization of the object
    Generalization,
    /// Neither specializes the other
    Peer,
}

/// The precomputed variation relation over the allowed dimension subspace.
#[derive(Debug, Clone)]
pub struct InterDimensionalVariationGraph {
    dimensions: Vec<ContentDimension>,
    subspace: DimensionSpacePointSet,
    weights: HashMap<String, ContentSubgraphVariationWeight>,
    normalization_base: u64,
    specializations: HashMap<String, DimensionSpacePointSet>,
    generalizations: HashMap<String, DimensionSpacePointSet>,
}

impl InterDimensionalVariationGraph {
    /// Builds the graph from the dimension configuration.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidDimensionConfiguration`] if any dimension is invalid or
    /// a dimension id is configured twice.
    pub fn new(configs: &[ContentDimensionConfig]) -> Result<Self> {
        let mut dimensions = Vec::with_capacity(configs.len());
        let mut seen = HashSet::new();
        for config in configs {
            if !seen.insert(config.id.clone()) {
                return Err(Error::InvalidDimensionConfiguration(format!(
                    "dimension '{}' configured twice",
                    config.id
                )));
            }
            dimensions.push(ContentDimension::from_config(config)?);
        }

        let normalization_base = dimensions
            .iter()
            .map(|d| u64::from(d.max_depth()) + 1)
            .max()
            .unwrap_or(1);

        // Cartesian product in configured order.
        let mut combinations: Vec<Vec<(String, String)>> = vec![Vec::new()];
        for dimension in &dimensions {
            let mut next = Vec::new();
            for combination in &combinations {
                for value in dimension.values() {
                    let mut extended = combination.clone();
                    extended.push((dimension.id().to_string(), value.to_string()));
                    next.push(extended);
                }
            }
            combinations = next;
        }
        let subspace: DimensionSpacePointSet = combinations
            .into_iter()
            .map(|pairs| DimensionSpacePoint::new(pairs.into_iter().collect()))
            .collect();

        let mut weights = HashMap::new();
        for point in subspace.iter() {
            let weight = ContentSubgraphVariationWeight::new(dimensions.iter().map(|d| {
                let depth = point
                    .coordinate(d.id().as_str())
                    .and_then(|value| d.depth(value))
                    .unwrap_or(0);
                (d.id().to_string(), depth)
            }));
            weights.insert(point.hash().to_string(), weight);
        }

        let mut graph = Self {
            dimensions,
            subspace,
            weights,
            normalization_base,
            specializations: HashMap::new(),
            generalizations: HashMap::new(),
        };
        graph.index_variations();
        Ok(graph)
    }

    fn index_variations(&mut self) {
        let closures: Vec<HashMap<String, HashSet<String>>> = self
            .dimensions
            .iter()
            .map(|d| {
                d.values()
                    .map(|v| (v.to_string(), d.specialization_closure(v).into_iter().collect()))
                    .collect()
            })
            .collect();

        let mut specializations: HashMap<String, Vec<(u64, DimensionSpacePoint)>> = HashMap::new();
        let mut generalizations: HashMap<String, Vec<(u64, DimensionSpacePoint)>> = HashMap::new();

        for general in self.subspace.iter() {
            for special in self.subspace.iter() {
                if general == special {
                    continue;
                }
                let specializes = self.dimensions.iter().zip(&closures).all(|(d, closure)| {
                    let id = d.id().as_str();
                    match (general.coordinate(id), special.coordinate(id)) {
                        (Some(g), Some(s)) => closure.get(g).is_some_and(|c| c.contains(s)),
                        _ => false,
                    }
                });
                if !specializes {
                    continue;
                }
                let distance = self
                    .normalized_weight(special)
                    .saturating_sub(self.normalized_weight(general));
                specializations
                    .entry(general.hash().to_string())
                    .or_default()
                    .push((distance, special.clone()));
                generalizations
                    .entry(special.hash().to_string())
                    .or_default()
                    .push((distance, general.clone()));
            }
        }

        let sorted = |mut entries: Vec<(u64, DimensionSpacePoint)>| -> DimensionSpacePointSet {
            entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.hash().cmp(b.1.hash())));
            entries.into_iter().map(|(_, point)| point).collect()
        };
        self.specializations = specializations
            .into_iter()
            .map(|(hash, entries)| (hash, sorted(entries)))
            .collect();
        self.generalizations = generalizations
            .into_iter()
            .map(|(hash, entries)| (hash, sorted(entries)))
            .collect();
    }

    fn normalized_weight(&self, point: &DimensionSpacePoint) -> u64 {
        self.weights
            .get(point.hash())
            .map(|w| w.normalize(self.normalization_base))
            .unwrap_or(0)
    }

    /// Returns the validated dimensions in configured order.
    pub fn dimensions(&self) -> &[ContentDimension] {
        &self.dimensions
    }

    /// Returns every point of the allowed dimension subspace.
    pub fn allowed_subspace(&self) -> &DimensionSpacePointSet {
        &self.subspace
    }

    /// Returns the point made of every dimension's default value.
    pub fn default_point(&self) -> DimensionSpacePoint {
        DimensionSpacePoint::new(
            self.dimensions
                .iter()
                .map(|d| (d.id().to_string(), d.default_value().to_string()))
                .collect(),
        )
    }

    /// Fails unless the point is part of the allowed subspace.
    pub fn require_allowed(&self, point: &DimensionSpacePoint) -> Result<()> {
        if self.subspace.contains(point) {
            Ok(())
        } else {
            Err(Error::DimensionSpacePointNotFound(point.to_json()))
        }
    }

    /// Returns the base used to fold weights into one number.
    pub fn normalization_base(&self) -> u64 {
        self.normalization_base
    }

    /// Returns the variation weight of a point.
    pub fn weight(&self, point: &DimensionSpacePoint) -> Option<&ContentSubgraphVariationWeight> {
        self.weights.get(point.hash())
    }

    /// Returns all transitive specializations, closest first.
    pub fn specializations(&self, point: &DimensionSpacePoint) -> DimensionSpacePointSet {
        self.specializations
            .get(point.hash())
            .cloned()
            .unwrap_or_default()
    }

    /// Returns all transitive generalizations, closest first.
    pub fn generalizations(&self, point: &DimensionSpacePoint) -> DimensionSpacePointSet {
        self.generalizations
            .get(point.hash())
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the closest generalization, the first fallback of a point.
    pub fn primary_generalization(&self, point: &DimensionSpacePoint) -> Option<DimensionSpacePoint> {
        self.generalizations
            .get(point.hash())
            .and_then(|set| set.iter().next().cloned())
    }

    /// Returns the origin (optionally) and its specializations, minus the
    /// excluded points.
    ///
    /// # Errors
    ///
    /// [`Error::DimensionSpacePointNotFound`] if the origin is not allowed.
    pub fn specialization_set(
        &self,
        origin: &DimensionSpacePoint,
        include_origin: bool,
        excluded: Option<&DimensionSpacePointSet>,
    ) -> Result<DimensionSpacePointSet> {
        self.require_allowed(origin)?;
        let mut set = DimensionSpacePointSet::new();
        if include_origin {
            set.insert(origin.clone());
        }
        for specialization in self.specializations(origin).iter() {
            if excluded.is_some_and(|excluded| excluded.contains(specialization)) {
                continue;
            }
            set.insert(specialization.clone());
        }
        Ok(set)
    }

    /// Classifies `subject` relative to `object`.
    pub fn variant_type(&self, subject: &DimensionSpacePoint, object: &DimensionSpacePoint) -> VariantType {
        if subject == object {
            return VariantType::Same;
        }
        if self
            .generalizations
            .get(object.hash())
            .is_some_and(|set| set.contains(subject))
        {
            return VariantType::Generalization;
        }
        if self
            .specializations
            .get(object.hash())
            .is_some_and(|set| set.contains(subject))
        {
            return VariantType::Specialization;
        }
        VariantType::Peer
    }

    /// Returns the points a variant at `origin` makes visible, given the
    /// origins the aggregate already occupies.
    ///
    /// A node at `origin` covers its origin and every specialization that is
    /// not closer to another occupied origin: specializations of occupied
    /// specializations of `origin` are carved out.
    pub fn effective_coverage(
        &self,
        origin: &DimensionSpacePoint,
        occupied: &DimensionSpacePointSet,
    ) -> Result<DimensionSpacePointSet> {
        let mut excluded = DimensionSpacePointSet::new();
        for occupied_point in occupied.iter() {
            if self.variant_type(occupied_point, origin) == VariantType::Specialization {
                excluded = excluded.union(&self.specialization_set(occupied_point, true, None)?);
            }
        }
        self.specialization_set(origin, true, Some(&excluded))
    }
}

// =============================================================================
// Tests
// =============================================================================
