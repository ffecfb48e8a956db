//! Reading and writing layers as `GeoJSON` `FeatureCollection` files.
//!
//! Layer metadata travels as foreign members of the collection:
//!
//! | Member | Meaning |
//! |--------|---------|
//! | `name` | layer name |
//! | `geometry_kind` | `Point`, `Polyline` or `Polygon` |
//! | `fields` | ordered schema, `[{"name": ..., "type": ...}]` |
//! | `crs` | spatial reference, copied verbatim |

use std::io::{BufWriter, Write as _};
use std::path::Path;
use std::str::FromStr as _;

use geojson::{FeatureCollection, GeoJson, JsonObject};
use muni_merge_layer_models::{Feature, FieldValue, GeometryKind, LayerSchema};

use crate::StoreError;
use crate::layer::Layer;

const NAME_MEMBER: &str = "name";
const KIND_MEMBER: &str = "geometry_kind";
const FIELDS_MEMBER: &str = "fields";
const CRS_MEMBER: &str = "crs";

/// Contents of a layer file before it is bound to a store.
#[derive(Debug, Clone)]
pub struct LayerFile {
    /// Declared layer name, if any.
    pub name: Option<String>,
    /// Declared geometry kind, if any.
    pub kind: Option<GeometryKind>,
    /// Declared schema, if any.
    pub schema: Option<LayerSchema>,
    /// Spatial reference (`crs` member).
    pub spatial_ref: Option<serde_json::Value>,
    /// Parsed features.
    pub features: Vec<Feature>,
}

impl LayerFile {
    /// Geometry kind declared by the file, or else the single kind shared
    /// by all of its features.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownGeometryKind`] when the kind cannot be
    /// determined (no features and nothing declared, a geometry collection,
    /// or features of mixed kinds).
    pub fn geometry_kind(&self, path: &Path) -> Result<GeometryKind, StoreError> {
        if let Some(kind) = self.kind {
            return Ok(kind);
        }

        let mut found: Option<GeometryKind> = None;
        for geometry in self.features.iter().filter_map(|f| f.geometry.as_ref()) {
            let kind = GeometryKind::of(geometry).ok_or_else(|| StoreError::UnknownGeometryKind {
                path: path.to_path_buf(),
                reason: "geometry collections are not supported".to_string(),
            })?;
            match found {
                None => found = Some(kind),
                Some(existing) if existing != kind => {
                    return Err(StoreError::UnknownGeometryKind {
                        path: path.to_path_buf(),
                        reason: format!("mixed {existing} and {kind} features"),
                    });
                }
                Some(_) => {}
            }
        }

        found.ok_or_else(|| StoreError::UnknownGeometryKind {
            path: path.to_path_buf(),
            reason: "no geometries and no declared geometry_kind".to_string(),
        })
    }

    /// Declared schema, or one inferred from the feature attributes.
    #[must_use]
    pub fn schema_or_inferred(&self) -> LayerSchema {
        self.schema
            .clone()
            .unwrap_or_else(|| LayerSchema::infer(self.features.iter().map(|f| &f.attributes)))
    }
}

/// Reads a `GeoJSON` `FeatureCollection` file.
///
/// Feature ids are kept when every feature carries a distinct non-negative
/// integer id; otherwise features are numbered from 1 in file order.
///
/// # Errors
///
/// Returns [`StoreError`] if the file cannot be read, is not valid
/// `GeoJSON`, or is not a `FeatureCollection`.
pub fn read_layer(path: &Path) -> Result<LayerFile, StoreError> {
    let contents = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let geojson: GeoJson = contents.parse().map_err(|e: geojson::Error| StoreError::GeoJson {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let GeoJson::FeatureCollection(collection) = geojson else {
        return Err(StoreError::NotAFeatureCollection(path.to_path_buf()));
    };

    let members = collection.foreign_members.unwrap_or_default();

    let name = members
        .get(NAME_MEMBER)
        .and_then(serde_json::Value::as_str)
        .map(ToString::to_string);

    let kind = match members.get(KIND_MEMBER).and_then(serde_json::Value::as_str) {
        Some(raw) => Some(GeometryKind::from_str(raw).map_err(|_| StoreError::UnknownGeometryKind {
            path: path.to_path_buf(),
            reason: format!("unrecognized geometry_kind {raw:?}"),
        })?),
        None => None,
    };

    let schema = match members.get(FIELDS_MEMBER) {
        Some(fields) => Some(serde_json::from_value::<LayerSchema>(fields.clone())?),
        None => None,
    };

    let spatial_ref = members.get(CRS_MEMBER).cloned();

    let ids: Vec<Option<u64>> = collection
        .features
        .iter()
        .map(|f| match &f.id {
            Some(geojson::feature::Id::Number(n)) => n.as_u64(),
            _ => None,
        })
        .collect();
    let keep_ids = ids.iter().all(Option::is_some) && {
        let mut sorted: Vec<u64> = ids.iter().flatten().copied().collect();
        sorted.sort_unstable();
        sorted.windows(2).all(|w| w[0] != w[1])
    };

    let mut features = Vec::with_capacity(collection.features.len());
    for (index, (feature, id)) in collection.features.into_iter().zip(ids).enumerate() {
        let fid = if keep_ids {
            id.unwrap_or_default()
        } else {
            index as u64 + 1
        };

        let geometry = match feature.geometry {
            Some(geometry) => Some(geo::Geometry::<f64>::try_from(geometry).map_err(
                |e: geojson::Error| StoreError::GeoJson {
                    path: path.to_path_buf(),
                    message: format!("feature {fid}: {e}"),
                },
            )?),
            None => None,
        };

        let mut record = Feature::new(fid, geometry);
        if let Some(properties) = feature.properties {
            for (key, value) in &properties {
                record
                    .attributes
                    .insert(key.clone(), FieldValue::from_json(value));
            }
        }
        features.push(record);
    }

    Ok(LayerFile {
        name,
        kind,
        schema,
        spatial_ref,
        features,
    })
}

/// Writes a layer as a `GeoJSON` `FeatureCollection`, replacing any
/// existing file.
///
/// # Errors
///
/// Returns [`StoreError`] if serialization or the write fails.
pub fn write_layer(path: &Path, layer: &Layer) -> Result<(), StoreError> {
    let mut members = JsonObject::new();
    members.insert(NAME_MEMBER.to_string(), layer.name().into());
    members.insert(KIND_MEMBER.to_string(), layer.kind().to_string().into());
    members.insert(
        FIELDS_MEMBER.to_string(),
        serde_json::to_value(layer.schema())?,
    );
    if let Some(crs) = layer.spatial_ref() {
        members.insert(CRS_MEMBER.to_string(), crs.clone());
    }

    let features = layer
        .features()
        .iter()
        .map(|feature| {
            let mut properties = JsonObject::new();
            for field in layer.schema().fields() {
                properties.insert(field.name.clone(), feature.get(&field.name).to_json());
            }
            geojson::Feature {
                bbox: None,
                geometry: feature
                    .geometry
                    .as_ref()
                    .map(|g| geojson::Geometry::new(geojson::Value::from(g))),
                id: Some(geojson::feature::Id::Number(feature.fid.into())),
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    let collection = FeatureCollection {
        bbox: None,
        features,
        foreign_members: Some(members),
    };

    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let file = std::fs::File::create(path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, &collection)?;
    writer.flush().map_err(io_err)?;
    Ok(())
}
