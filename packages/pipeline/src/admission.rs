//! Completeness predicates applied when merging features.
//!
//! Each geometry kind admits a feature only when every condition of its
//! predicate holds. Conditions follow SQL `NULL` semantics: a missing, null,
//! or non-numeric value never satisfies a numeric comparison.

use std::fmt;

use muni_merge_layer_models::{Feature, GeometryKind, LENGTH_FIELD};

use crate::config::{FieldNames, LengthBounds};

/// A single test over one attribute field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `field <> 0`.
    NonZero(String),
    /// `field IS NOT NULL AND TRIM(field) <> ''`.
    NotBlank(String),
    /// `field > min AND field < max`.
    Between {
        /// Tested field.
        field: String,
        /// Exclusive lower bound.
        min: f64,
        /// Exclusive upper bound.
        max: f64,
    },
}

impl Condition {
    /// Whether `feature` satisfies this condition.
    #[must_use]
    pub fn holds(&self, feature: &Feature) -> bool {
        match self {
            Self::NonZero(field) => feature.get(field).as_f64().is_some_and(|n| n != 0.0),
            Self::NotBlank(field) => {
                let value = feature.get(field);
                !value.is_null() && !value.to_string().trim().is_empty()
            }
            Self::Between { field, min, max } => feature
                .get(field)
                .as_f64()
                .is_some_and(|n| n > *min && n < *max),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonZero(field) => write!(f, "{field} <> 0"),
            Self::NotBlank(field) => write!(f, "{field} IS NOT NULL AND {field} <> ''"),
            Self::Between { field, min, max } => write!(f, "{field} > {min} AND {field} < {max}"),
        }
    }
}

/// Conjunction of conditions a feature must meet to be merged.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionPredicate {
    kind: GeometryKind,
    conditions: Vec<Condition>,
}

impl AdmissionPredicate {
    /// Predicate for layers of `kind`.
    ///
    /// * Point: building number, height and apartments all non-zero.
    /// * Polyline: street name present and not blank, `LENGTH` strictly
    ///   inside `bounds`.
    /// * Polygon: block number non-zero.
    #[must_use]
    pub fn for_kind(kind: GeometryKind, fields: &FieldNames, bounds: &LengthBounds) -> Self {
        let conditions = match kind {
            GeometryKind::Point => vec![
                Condition::NonZero(fields.building_number.clone()),
                Condition::NonZero(fields.height.clone()),
                Condition::NonZero(fields.apartments.clone()),
            ],
            GeometryKind::Polyline => vec![
                Condition::NotBlank(fields.street_name.clone()),
                Condition::Between {
                    field: LENGTH_FIELD.to_string(),
                    min: bounds.min,
                    max: bounds.max,
                },
            ],
            GeometryKind::Polygon => vec![Condition::NonZero(fields.block_number.clone())],
        };
        Self { kind, conditions }
    }

    /// Geometry kind this predicate applies to.
    #[must_use]
    pub const fn kind(&self) -> GeometryKind {
        self.kind
    }

    /// The conditions, all of which must hold.
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Whether `feature` may be merged.
    #[must_use]
    pub fn admits(&self, feature: &Feature) -> bool {
        self.conditions.iter().all(|c| c.holds(feature))
    }
}

impl fmt::Display for AdmissionPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, condition) in self.conditions.iter().enumerate() {
            if i > 0 {
                f.write_str(" AND ")?;
            }
            write!(f, "{condition}")?;
        }
        Ok(())
    }
}
