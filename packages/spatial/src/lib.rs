#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Geometry engine for layer consolidation.
//!
//! Computes the derived measurements (length, area, point coordinates)
//! attached to every feature, and provides an R-tree backed intersection
//! index used by the building/block spatial join.

use geo::{
    Area, BoundingRect, Centroid, Euclidean, Geodesic, GeodesicArea, Geometry, Intersects,
    Length,
};
use muni_merge_layer_models::GeometryKind;
use rstar::{AABB, RTree, RTreeObject};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Errors raised when a measurement cannot be computed.
#[derive(Debug, Error)]
pub enum SpatialError {
    /// The geometry has a different family than the measurement needs.
    #[error("expected {expected} geometry, found {found}")]
    WrongKind {
        /// Family the measurement applies to.
        expected: GeometryKind,
        /// Family of the geometry that was passed.
        found: String,
    },

    /// The geometry has no coordinates to measure.
    #[error("geometry is empty")]
    Empty,

    /// The measurement produced NaN or infinity.
    #[error("measurement is not finite: {value}")]
    NonFinite {
        /// The offending value.
        value: f64,
    },
}

/// How distances and areas are measured.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Measure {
    /// Cartesian math on projected coordinates already in meters.
    Planar,
    /// Ellipsoidal math on longitude/latitude coordinates.
    Geodesic,
    /// Geodesic for layers referenced to EPSG:4326 / CRS84, planar
    /// otherwise.
    #[default]
    Auto,
}

impl Measure {
    /// Resolves [`Measure::Auto`] against a layer's spatial reference
    /// identifier (for example `urn:ogc:def:crs:EPSG::4326`).
    #[must_use]
    pub fn resolve(self, spatial_ref: Option<&str>) -> Self {
        match self {
            Self::Auto => {
                if spatial_ref.is_some_and(is_geographic) {
                    Self::Geodesic
                } else {
                    Self::Planar
                }
            }
            other => other,
        }
    }
}

/// Whether a CRS identifier names WGS 84 longitude/latitude: an EPSG code
/// of exactly `4326` (`EPSG:4326`, `urn:ogc:def:crs:EPSG::4326`) or
/// `CRS84`.
fn is_geographic(crs: &str) -> bool {
    let crs = crs.trim().to_ascii_uppercase();
    if crs.ends_with("CRS84") {
        return true;
    }
    crs.strip_suffix("4326")
        .is_some_and(|head| head.ends_with(':') && head.contains("EPSG"))
}

/// Computes derived measurements for feature geometries.
#[derive(Debug, Clone, Copy)]
pub struct GeometryEngine {
    measure: Measure,
}

impl GeometryEngine {
    /// Creates an engine for a layer, resolving [`Measure::Auto`] against
    /// the layer's spatial reference.
    #[must_use]
    pub fn new(measure: Measure, spatial_ref: Option<&str>) -> Self {
        Self {
            measure: measure.resolve(spatial_ref),
        }
    }

    /// The resolved measure in use.
    #[must_use]
    pub const fn measure(&self) -> Measure {
        self.measure
    }

    /// Length of a linear geometry in meters.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError`] if the geometry is not linear or the result
    /// is not finite.
    pub fn length(&self, geometry: &Geometry<f64>) -> Result<f64, SpatialError> {
        let length = match (geometry, self.measure) {
            (Geometry::Line(line), Measure::Geodesic) => Geodesic.length(line),
            (Geometry::Line(line), _) => Euclidean.length(line),
            (Geometry::LineString(ls), Measure::Geodesic) => Geodesic.length(ls),
            (Geometry::LineString(ls), _) => Euclidean.length(ls),
            (Geometry::MultiLineString(mls), Measure::Geodesic) => Geodesic.length(mls),
            (Geometry::MultiLineString(mls), _) => Euclidean.length(mls),
            (other, _) => {
                return Err(wrong_kind(GeometryKind::Polyline, other));
            }
        };
        finite(length)
    }

    /// Unsigned area of a polygonal geometry in square meters.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError`] if the geometry is not polygonal or the
    /// result is not finite.
    pub fn area(&self, geometry: &Geometry<f64>) -> Result<f64, SpatialError> {
        if GeometryKind::of(geometry) != Some(GeometryKind::Polygon) {
            return Err(wrong_kind(GeometryKind::Polygon, geometry));
        }

        let area = match self.measure {
            Measure::Geodesic => match geometry {
                Geometry::Polygon(p) => p.geodesic_area_unsigned(),
                Geometry::MultiPolygon(mp) => mp.geodesic_area_unsigned(),
                Geometry::Rect(r) => r.to_polygon().geodesic_area_unsigned(),
                Geometry::Triangle(t) => t.to_polygon().geodesic_area_unsigned(),
                other => return Err(wrong_kind(GeometryKind::Polygon, other)),
            },
            Measure::Planar | Measure::Auto => geometry.unsigned_area(),
        };
        finite(area)
    }

    /// Representative `(x, y)` of a point geometry (the centroid for
    /// multipoints).
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError`] if the geometry is not a point family or is
    /// empty.
    pub fn centroid(&self, geometry: &Geometry<f64>) -> Result<(f64, f64), SpatialError> {
        if GeometryKind::of(geometry) != Some(GeometryKind::Point) {
            return Err(wrong_kind(GeometryKind::Point, geometry));
        }
        let point = geometry.centroid().ok_or(SpatialError::Empty)?;
        Ok((finite(point.x())?, finite(point.y())?))
    }

    /// Whether two geometries share at least one point.
    #[must_use]
    pub fn intersects(&self, a: &Geometry<f64>, b: &Geometry<f64>) -> bool {
        a.intersects(b)
    }
}

fn wrong_kind(expected: GeometryKind, found: &Geometry<f64>) -> SpatialError {
    SpatialError::WrongKind {
        expected,
        found: GeometryKind::of(found)
            .map_or_else(|| "GeometryCollection".to_string(), |k| k.to_string()),
    }
}

const fn finite(value: f64) -> Result<f64, SpatialError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(SpatialError::NonFinite { value })
    }
}

/// A geometry stored in the R-tree with the caller's identifier.
struct IndexEntry<T> {
    id: T,
    order: usize,
    envelope: AABB<[f64; 2]>,
    geometry: Geometry<f64>,
}

impl<T> RTreeObject for IndexEntry<T> {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Bulk-loaded R-tree answering "which indexed geometries intersect this
/// one?" queries.
///
/// Candidates are found by envelope overlap and then confirmed with an
/// exact intersection test. Results come back in insertion order.
pub struct IntersectionIndex<T> {
    tree: RTree<IndexEntry<T>>,
}

impl<T: Clone> IntersectionIndex<T> {
    /// Builds the index. Empty geometries are left out since they cannot
    /// intersect anything.
    #[must_use]
    pub fn build(items: impl IntoIterator<Item = (T, Geometry<f64>)>) -> Self {
        let entries: Vec<IndexEntry<T>> = items
            .into_iter()
            .enumerate()
            .filter_map(|(order, (id, geometry))| {
                let envelope = compute_envelope(&geometry)?;
                Some(IndexEntry {
                    id,
                    order,
                    envelope,
                    geometry,
                })
            })
            .collect();

        log::trace!("Bulk loading {} geometries into intersection index", entries.len());

        Self {
            tree: RTree::bulk_load(entries),
        }
    }

    /// Number of indexed geometries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.size()
    }

    /// Whether nothing was indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// Identifiers of every indexed geometry intersecting `geometry`.
    #[must_use]
    pub fn intersecting(&self, geometry: &Geometry<f64>) -> Vec<T> {
        let Some(query_env) = compute_envelope(geometry) else {
            return Vec::new();
        };

        let mut hits: Vec<&IndexEntry<T>> = self
            .tree
            .locate_in_envelope_intersecting(&query_env)
            .filter(|entry| entry.geometry.intersects(geometry))
            .collect();
        hits.sort_by_key(|entry| entry.order);
        hits.into_iter().map(|entry| entry.id.clone()).collect()
    }
}

/// Compute the bounding box envelope for a geometry, `None` when empty.
fn compute_envelope(geometry: &Geometry<f64>) -> Option<AABB<[f64; 2]>> {
    geometry
        .bounding_rect()
        .map(|rect| AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]))
}
