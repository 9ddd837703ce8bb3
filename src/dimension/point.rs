//! Dimension space points and sets of them.

use std::collections::BTreeMap;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::Result;

/// One coordinate per dimension, e.g. `{"language": "de"}`.
///
/// # Hash
///
/// Every point carries a stable hash: `xxh3_64` over the canonical JSON
/// (keys sorted), rendered as 16 hex digits. Hierarchy edges are keyed by
/// this hash, so it must never change between versions.
///
/// # Rust Pattern: serde(from/into)
///
/// The point serializes as its plain coordinate map. Deserializing goes
/// through `From<BTreeMap<..>>`, which recomputes the hash, so a point read
/// from the event log is indistinguishable from one built in code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct DimensionSpacePoint {
    coordinates: BTreeMap<String, String>,
    hash: String,
}

impl DimensionSpacePoint {
    /// Creates a point from its coordinates.
    pub fn new(coordinates: BTreeMap<String, String>) -> Self {
        let hash = format!("{:016x}", xxh3_64(canonical_json(&coordinates).as_bytes()));
        Self { coordinates, hash }
    }

    /// Creates a point from `(dimension, value)` pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self::new(
            pairs
                .into_iter()
                .map(|(dimension, value)| (dimension.to_string(), value.to_string()))
                .collect(),
        )
    }

    /// The point of a repository without dimensions.
    pub fn empty() -> Self {
        Self::new(BTreeMap::new())
    }

    /// Parses a point from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self> {
        let coordinates: BTreeMap<String, String> = serde_json::from_str(json)?;
        Ok(Self::new(coordinates))
    }

    /// Returns the canonical JSON representation.
    pub fn to_json(&self) -> String {
        canonical_json(&self.coordinates)
    }

    /// Returns the stable hash.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Returns the coordinate of one dimension.
    pub fn coordinate(&self, dimension: &str) -> Option<&str> {
        self.coordinates.get(dimension).map(String::as_str)
    }

    /// Returns all coordinates.
    pub fn coordinates(&self) -> &BTreeMap<String, String> {
        &self.coordinates
    }

    /// Returns a copy of this point with one coordinate replaced.
    pub fn vary(&self, dimension: &str, value: &str) -> Self {
        let mut coordinates = self.coordinates.clone();
        coordinates.insert(dimension.to_string(), value.to_string());
        Self::new(coordinates)
    }
}

fn canonical_json(coordinates: &BTreeMap<String, String>) -> String {
    // A BTreeMap serializes with sorted keys; the map of strings cannot fail.
    serde_json::to_string(coordinates).unwrap_or_default()
}

impl From<BTreeMap<String, String>> for DimensionSpacePoint {
    fn from(coordinates: BTreeMap<String, String>) -> Self {
        Self::new(coordinates)
    }
}

impl From<DimensionSpacePoint> for BTreeMap<String, String> {
    fn from(point: DimensionSpacePoint) -> Self {
        point.coordinates
    }
}

impl fmt::Display for DimensionSpacePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_json())
    }
}

// =============================================================================
// Point Sets
// =============================================================================

/// An insertion-ordered set of dimension space points, keyed by hash.
///
/// Equality ignores order. Serialized as a JSON array of points.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<DimensionSpacePoint>", into = "Vec<DimensionSpacePoint>")]
pub struct DimensionSpacePointSet {
    points: IndexMap<String, DimensionSpacePoint>,
}

impl DimensionSpacePointSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a point; returns false if it was already present.
    pub fn insert(&mut self, point: DimensionSpacePoint) -> bool {
        if self.points.contains_key(point.hash()) {
            return false;
        }
        self.points.insert(point.hash().to_string(), point);
        true
    }

    /// Returns true if the point is in the set.
    pub fn contains(&self, point: &DimensionSpacePoint) -> bool {
        self.points.contains_key(point.hash())
    }

    /// Returns true if a point with this hash is in the set.
    pub fn contains_hash(&self, hash: &str) -> bool {
        self.points.contains_key(hash)
    }

    /// Looks a point up by hash.
    pub fn get(&self, hash: &str) -> Option<&DimensionSpacePoint> {
        self.points.get(hash)
    }

    /// Returns the number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Iterates the points in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &DimensionSpacePoint> {
        self.points.values()
    }

    /// Iterates the point hashes in insertion order.
    pub fn hashes(&self) -> impl Iterator<Item = &str> {
        self.points.keys().map(String::as_str)
    }

    /// Points in either set.
    pub fn union(&self, other: &Self) -> Self {
        let mut result = self.clone();
        for point in other.iter() {
            result.insert(point.clone());
        }
        result
    }

    /// Points in both sets, in this set's order.
    pub fn intersection(&self, other: &Self) -> Self {
        self.iter().filter(|p| other.contains(p)).cloned().collect()
    }

    /// Points in this set but not in the other.
    pub fn difference(&self, other: &Self) -> Self {
        self.iter().filter(|p| !other.contains(p)).cloned().collect()
    }

    /// Returns true if every point of this set is in the other.
    pub fn is_subset(&self, other: &Self) -> bool {
        self.iter().all(|p| other.contains(p))
    }
}

impl FromIterator<DimensionSpacePoint> for DimensionSpacePointSet {
    fn from_iter<I: IntoIterator<Item = DimensionSpacePoint>>(iter: I) -> Self {
        let mut set = Self::new();
        for point in iter {
            set.insert(point);
        }
        set
    }
}

impl From<Vec<DimensionSpacePoint>> for DimensionSpacePointSet {
    fn from(points: Vec<DimensionSpacePoint>) -> Self {
        points.into_iter().collect()
    }
}

impl From<DimensionSpacePointSet> for Vec<DimensionSpacePoint> {
    fn from(set: DimensionSpacePointSet) -> Self {
        set.points.into_values().collect()
    }
}

impl<'a> IntoIterator for &'a DimensionSpacePointSet {
    type Item = &'a DimensionSpacePoint;
    type IntoIter = indexmap::map::Values<'a, String, DimensionSpacePoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.values()
    }
}

// =============================================================================
// Tests
// =============================================================================
