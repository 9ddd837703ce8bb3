//! # Variation Weights
//!
//! The weight of a dimension space point is its specialization depth per
//! dimension. Weights rank variant candidates "most specific first".
//!
//! ## Comparability
//!
//! Two weights can only be compared when they are derived from the same
//! dimension combination. Comparing weights over different dimensions is a
//! programming error and is reported as [`Error::IncomparableWeights`]; it is
//! never coerced into `Less`/`Greater`. That is why [`compare`] returns a
//! `Result` and the type deliberately does not implement `PartialOrd`.
//!
//! [`compare`]: ContentSubgraphVariationWeight::compare

use std::cmp::Ordering;
use std::fmt;

use indexmap::IndexMap;

use crate::error::{Error, Result};

/// Specialization depth per dimension, in configured dimension order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSubgraphVariationWeight {
    components: IndexMap<String, u32>,
}

impl ContentSubgraphVariationWeight {
    /// Creates a weight from `(dimension, depth)` pairs in configured order.
    pub fn new(components: impl IntoIterator<Item = (String, u32)>) -> Self {
        Self {
            components: components.into_iter().collect(),
        }
    }

    /// Returns the depth in one dimension.
    pub fn component(&self, dimension: &str) -> Option<u32> {
        self.components.get(dimension).copied()
    }

    /// Returns true if both weights cover the same dimensions.
    pub fn can_be_compared_to(&self, other: &Self) -> bool {
        self.components.len() == other.components.len()
            && self.components.keys().all(|k| other.components.contains_key(k))
    }

    /// Compares two weights, first configured dimension most significant.
    ///
    /// # Errors
    ///
    /// [`Error::IncomparableWeights`] if the weights cover different
    /// dimensions.
    pub fn compare(&self, other: &Self) -> Result<Ordering> {
        if !self.can_be_compared_to(other) {
            return Err(Error::IncomparableWeights {
                left: self.to_string(),
                right: other.to_string(),
            });
        }
        for (dimension, depth) in &self.components {
            let other_depth = other.components.get(dimension).copied().unwrap_or(0);
            match depth.cmp(&other_depth) {
                Ordering::Equal => continue,
                unequal => return Ok(unequal),
            }
        }
        Ok(Ordering::Equal)
    }

    /// Sum of the specialization depths over all dimensions.
    pub fn total(&self) -> u32 {
        self.components.values().sum()
    }

    /// Folds the weight into one number, with `base` greater than every
    /// component so the first dimension dominates.
    pub fn normalize(&self, base: u64) -> u64 {
        self.components
            .values()
            .fold(0, |acc, depth| acc * base + u64::from(*depth))
    }
}

impl fmt::Display for ContentSubgraphVariationWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (index, (dimension, depth)) in self.components.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dimension}: {depth}")?;
        }
        write!(f, "}}")
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn weight(pairs: &[(&str, u32)]) -> ContentSubgraphVariationWeight {
        ContentSubgraphVariationWeight::new(pairs.iter().map(|(d, w)| (d.to_string(), *w)))
    }

    #[test]
    fn test_compare_same_dimensions() {
        let a = weight(&[("language", 1), ("market", 0)]);
        let b = weight(&[("language", 0), ("market", 2)]);
        assert_eq!(a.compare(&b).unwrap(), Ordering::Greater);
        assert_eq!(b.compare(&a).unwrap(), Ordering::Less);
        assert_eq!(a.compare(&a.clone()).unwrap(), Ordering::Equal);
        assert_eq!(a.total(), 1);
        assert_eq!(b.total(), 2);
    }

    /// Comparing weights of different dimension combinations must fail.
    #[test]
    fn test_incomparable_weights_fail() {
        let a = weight(&[("language", 1)]);
        let b = weight(&[("market", 1)]);
        let err = a.compare(&b).unwrap_err();
        assert!(matches!(err, Error::IncomparableWeights { .. }));
        assert_eq!(err.kind(), "IncomparableWeights");

        let c = weight(&[("language", 1), ("market", 0)]);
        assert!(a.compare(&c).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            weight(&[("language", 2), ("market", 0)]).to_string(),
            "{language: 2, market: 0}"
        );
    }

    proptest! {
        /// Over one dimension combination the comparison is a total order
        /// that agrees with the normalized weight.
        #[test]
        fn prop_compare_agrees_with_normalized(
            left in proptest::collection::vec(0u32..5, 3),
            right in proptest::collection::vec(0u32..5, 3),
        ) {
            let dims = ["language", "market", "channel"];
            let a = ContentSubgraphVariationWeight::new(
                dims.iter().map(|d| d.to_string()).zip(left.iter().copied()),
            );
            let b = ContentSubgraphVariationWeight::new(
                dims.iter().map(|d| d.to_string()).zip(right.iter().copied()),
            );

            let ordering = a.compare(&b).unwrap();
            prop_assert_eq!(ordering, a.normalize(5).cmp(&b.normalize(5)));
            prop_assert_eq!(ordering.reverse(), b.compare(&a).unwrap());
            prop_assert_eq!(ordering == Ordering::Equal, left == right);
        }

        /// Different dimension combinations never compare.
        #[test]
        fn prop_different_dimensions_never_compare(depth in 0u32..5, other in 0u32..5) {
            let a = ContentSubgraphVariationWeight::new([("language".to_string(), depth)]);
            let b = ContentSubgraphVariationWeight::new([("market".to_string(), other)]);
            prop_assert!(a.compare(&b).is_err());
        }
    }
}
