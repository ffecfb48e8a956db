#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Vector layer types shared by the whole consolidation toolchain.
//!
//! Each municipality ships its raw data as a folder of vector layers (roads
//! as polylines, buildings as points, blocks as polygons). These types
//! describe those layers, their attribute schemas, and the canonical names
//! under which they are merged into the consolidated dataset.

pub mod field;

use std::collections::BTreeMap;

use geo::Geometry;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

pub use field::{FieldDef, FieldType, FieldValue, LayerSchema};

/// Derived length field for polyline layers (meters).
pub const LENGTH_FIELD: &str = "LENGTH";

/// Derived X coordinate field for point layers.
pub const POINT_X_FIELD: &str = "POINT_X";

/// Derived Y coordinate field for point layers.
pub const POINT_Y_FIELD: &str = "POINT_Y";

/// Derived area field for polygon layers (square meters).
pub const POLY_AREA_FIELD: &str = "POLY_AREA";

/// Synthesized building identifier field, `BL{block}#{building}`.
pub const NEW_NUMBER_FIELD: &str = "new_number";

/// Separator between the city and the layer base name in a canonical name.
pub const NAME_DELIMITER: char = '_';

/// Geometry family of a vector layer.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[strum(ascii_case_insensitive)]
pub enum GeometryKind {
    /// Point features (buildings).
    Point,
    /// Line features (roads).
    Polyline,
    /// Area features (blocks).
    Polygon,
}

impl GeometryKind {
    /// All geometry kinds, in the order layers are usually described.
    pub const ALL: &[Self] = &[Self::Point, Self::Polyline, Self::Polygon];

    /// Classifies a geometry into its layer family.
    ///
    /// Returns `None` for geometry collections, which cannot be stored in a
    /// single-kind layer.
    #[must_use]
    pub const fn of(geometry: &Geometry<f64>) -> Option<Self> {
        match geometry {
            Geometry::Point(_) | Geometry::MultiPoint(_) => Some(Self::Point),
            Geometry::Line(_) | Geometry::LineString(_) | Geometry::MultiLineString(_) => {
                Some(Self::Polyline)
            }
            Geometry::Polygon(_)
            | Geometry::MultiPolygon(_)
            | Geometry::Rect(_)
            | Geometry::Triangle(_) => Some(Self::Polygon),
            Geometry::GeometryCollection(_) => None,
        }
    }

    /// Fields added to every layer of this kind by geometry annotation.
    #[must_use]
    pub fn derived_fields(self) -> Vec<FieldDef> {
        match self {
            Self::Point => vec![
                FieldDef::new(POINT_X_FIELD, FieldType::Integer),
                FieldDef::new(POINT_Y_FIELD, FieldType::Integer),
                FieldDef::new(NEW_NUMBER_FIELD, FieldType::Text),
            ],
            Self::Polyline => vec![FieldDef::new(LENGTH_FIELD, FieldType::Integer)],
            Self::Polygon => vec![FieldDef::new(POLY_AREA_FIELD, FieldType::Integer)],
        }
    }
}

/// Deterministic destination layer name, rendered as `{city}_{base}`.
///
/// `base` is the native layer name without its file extension. Layers from
/// different cities never collide because the city is always part of the
/// name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CanonicalName {
    city: String,
    base: String,
}

impl CanonicalName {
    /// Creates a canonical name from its parts.
    #[must_use]
    pub fn new(city: impl Into<String>, base: impl Into<String>) -> Self {
        Self {
            city: city.into(),
            base: base.into(),
        }
    }

    /// Creates a canonical name from a city and a native layer file name
    /// such as `roads.geojson`.
    #[must_use]
    pub fn from_native(city: impl Into<String>, native_name: &str) -> Self {
        Self::new(city, strip_extension(native_name))
    }

    /// Splits a rendered canonical name back into city and layer kind.
    ///
    /// The last delimiter separates the two, so city names may themselves
    /// contain the delimiter (`North_East_blocks` → `North_East` +
    /// `blocks`). Returns `None` when there is no delimiter or either side
    /// is empty.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let (city, base) = name.rsplit_once(NAME_DELIMITER)?;
        if city.is_empty() || base.is_empty() {
            return None;
        }
        Some(Self::new(city, base))
    }

    /// The owning city (source folder name).
    #[must_use]
    pub fn city(&self) -> &str {
        &self.city
    }

    /// The layer base name (native name without extension).
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }
}

impl std::fmt::Display for CanonicalName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{NAME_DELIMITER}{}", self.city, self.base)
    }
}

/// Association of a building with the block polygon it intersects.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildingBlockLink {
    /// Block number (value of the block layer's number field).
    pub block: FieldValue,
    /// Building id (value of the building layer's number field).
    pub building: FieldValue,
}

impl BuildingBlockLink {
    /// Creates a link.
    #[must_use]
    pub const fn new(block: FieldValue, building: FieldValue) -> Self {
        Self { block, building }
    }

    /// Composite identifier written to [`NEW_NUMBER_FIELD`], e.g. `BL7#101`.
    #[must_use]
    pub fn identifier(&self) -> String {
        format!("BL{}#{}", self.block, self.building)
    }
}

/// Strips the final file extension from a layer file name.
///
/// Names without an extension (or dot-files such as `.hidden`) are returned
/// unchanged.
#[must_use]
pub fn strip_extension(native_name: &str) -> &str {
    match native_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => native_name,
    }
}

static NULL_VALUE: FieldValue = FieldValue::Null;

/// One row of a layer: attributes plus an optional geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    /// Feature id, unique within its layer.
    pub fid: u64,
    /// Shape of the feature, if any.
    pub geometry: Option<Geometry<f64>>,
    /// Attribute values keyed by field name.
    pub attributes: BTreeMap<String, FieldValue>,
}

impl Feature {
    /// Creates a feature without attributes.
    #[must_use]
    pub const fn new(fid: u64, geometry: Option<Geometry<f64>>) -> Self {
        Self {
            fid,
            geometry,
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter.
    #[must_use]
    pub fn with(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.set(field, value);
        self
    }

    /// Returns the value of `field`, or [`FieldValue::Null`] when absent.
    #[must_use]
    pub fn get(&self, field: &str) -> &FieldValue {
        self.attributes.get(field).unwrap_or(&NULL_VALUE)
    }

    /// Sets the value of `field`.
    pub fn set(&mut self, field: &str, value: impl Into<FieldValue>) {
        self.attributes.insert(field.to_string(), value.into());
    }

    /// Geometry family of this feature's shape.
    #[must_use]
    pub fn kind(&self) -> Option<GeometryKind> {
        self.geometry.as_ref().and_then(GeometryKind::of)
    }
}
