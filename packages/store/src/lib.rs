#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Feature store for the consolidated dataset.
//!
//! A [`Dataset`] is a directory holding one `GeoJSON` `FeatureCollection`
//! file per layer (`{name}.geojson`). Layers are loaded into memory, edited
//! through schema-checked operations (create from template, filtered
//! append, attribute selection, field updates), and written back with
//! [`Dataset::save`].
//!
//! Transient layers (spatial-join results) live in a [`MemoryWorkspace`]
//! instead and are never written to disk.

pub mod io;
pub mod layer;
pub mod workspace;

use std::path::{Path, PathBuf};

use muni_merge_layer_models::{Feature, FieldType, FieldValue, GeometryKind, LayerSchema};
use thiserror::Error;

pub use layer::{AppendSummary, Layer, Row, Selection};
pub use workspace::{MemoryWorkspace, ScratchLayer};

/// File extension of stored layers.
pub const LAYER_EXTENSION: &str = "geojson";

/// Errors that can occur during feature store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// File system operation failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A layer file is not valid `GeoJSON`.
    #[error("GeoJSON error in {path}: {message}")]
    GeoJson {
        /// Offending file.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// JSON (de)serialization of layer metadata failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A layer file holds something other than a `FeatureCollection`.
    #[error("{0} is not a GeoJSON FeatureCollection")]
    NotAFeatureCollection(PathBuf),

    /// The geometry kind of a layer file cannot be determined.
    #[error("cannot determine geometry kind of {path}: {reason}")]
    UnknownGeometryKind {
        /// Offending file.
        path: PathBuf,
        /// Why the kind is unknown.
        reason: String,
    },

    /// A layer with this name already exists.
    #[error("layer {0} already exists")]
    LayerExists(String),

    /// No layer with this name exists.
    #[error("layer {0} not found")]
    LayerNotFound(String),

    /// The name cannot be used as a layer file name.
    #[error("invalid layer name {0:?}")]
    InvalidName(String),

    /// A field is missing from a layer schema.
    #[error("field {field} not found in layer {layer}")]
    FieldNotFound {
        /// Layer name.
        layer: String,
        /// Missing field.
        field: String,
    },

    /// A feature id is missing from a layer.
    #[error("feature {fid} not found in layer {layer}")]
    FeatureNotFound {
        /// Layer name.
        layer: String,
        /// Missing feature id.
        fid: u64,
    },

    /// A value cannot be stored in a field of the given type.
    #[error("value {value:?} does not fit {field_type} field {field} in layer {layer}")]
    TypeMismatch {
        /// Layer name.
        layer: String,
        /// Field name.
        field: String,
        /// Declared field type.
        field_type: FieldType,
        /// Rendered value.
        value: String,
    },

    /// A feature's geometry does not match its layer's kind.
    #[error("feature {fid} has {found} geometry but layer {layer} holds {expected}")]
    GeometryMismatch {
        /// Layer name.
        layer: String,
        /// Offending feature id.
        fid: u64,
        /// Layer kind.
        expected: GeometryKind,
        /// Feature kind.
        found: String,
    },

    /// Every feature id up to `u64::MAX` is taken.
    #[error("layer {layer} has no feature id left")]
    FidExhausted {
        /// Layer name.
        layer: String,
    },

    /// The dataset directory already holds layers and overwriting is off.
    #[error("dataset {0} already contains layers")]
    DatasetNotEmpty(PathBuf),
}

/// A directory of layers, loaded in memory.
///
/// Layers keep their creation order (or file-name order when opened from
/// disk).
#[derive(Debug)]
pub struct Dataset {
    root: PathBuf,
    layers: Vec<Layer>,
}

impl Dataset {
    /// Creates the dataset directory.
    ///
    /// When the directory already exists its layer files are removed if
    /// `overwrite` is set; otherwise an existing directory must not hold
    /// any layer file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the directory cannot be created or
    /// cleared, or holds layers while `overwrite` is off.
    pub fn create(root: &Path, overwrite: bool) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root).map_err(|source| StoreError::Io {
            path: root.to_path_buf(),
            source,
        })?;

        let existing = layer_files(root)?;
        if !existing.is_empty() {
            if !overwrite {
                return Err(StoreError::DatasetNotEmpty(root.to_path_buf()));
            }
            log::info!(
                "Overwriting {} existing layer(s) in {}",
                existing.len(),
                root.display()
            );
            for path in existing {
                std::fs::remove_file(&path).map_err(|source| StoreError::Io { path, source })?;
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            layers: Vec::new(),
        })
    }

    /// Opens an existing dataset, loading every layer file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the directory or any layer file cannot be
    /// read.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let mut layers = Vec::new();
        for path in layer_files(root)? {
            let file = io::read_layer(&path)?;
            let kind = file.geometry_kind(&path)?;
            let schema = file.schema_or_inferred();
            let name = file.name.clone().unwrap_or_else(|| {
                path.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });
            layers.push(Layer::with_features(
                name,
                kind,
                schema,
                file.spatial_ref,
                file.features,
            ));
        }
        log::debug!("Opened dataset {} with {} layer(s)", root.display(), layers.len());

        Ok(Self {
            root: root.to_path_buf(),
            layers,
        })
    }

    /// Dataset directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All layers in order.
    #[must_use]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Looks up a layer by name.
    #[must_use]
    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name() == name)
    }

    /// Looks up a layer by name for mutation.
    pub fn layer_mut(&mut self, name: &str) -> Option<&mut Layer> {
        self.layers.iter_mut().find(|l| l.name() == name)
    }

    /// Looks up a layer, failing when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LayerNotFound`] if there is no such layer.
    pub fn require(&self, name: &str) -> Result<&Layer, StoreError> {
        self.layer(name)
            .ok_or_else(|| StoreError::LayerNotFound(name.to_string()))
    }

    /// Mutable variant of [`Dataset::require`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LayerNotFound`] if there is no such layer.
    pub fn require_mut(&mut self, name: &str) -> Result<&mut Layer, StoreError> {
        self.layer_mut(name)
            .ok_or_else(|| StoreError::LayerNotFound(name.to_string()))
    }

    /// Creates an empty layer whose schema is a copy of `template`, and
    /// writes it to disk immediately.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the name is invalid or taken, or the file
    /// cannot be written.
    pub fn create_layer(
        &mut self,
        name: &str,
        kind: GeometryKind,
        template: &LayerSchema,
        spatial_ref: Option<serde_json::Value>,
    ) -> Result<&Layer, StoreError> {
        validate_name(name)?;
        if self.layer(name).is_some() {
            return Err(StoreError::LayerExists(name.to_string()));
        }

        let layer = Layer::new(name, kind, template.clone(), spatial_ref);
        io::write_layer(&self.layer_path(name), &layer)?;
        log::debug!("Created {kind} layer {name} with {} field(s)", template.len());

        self.layers.push(layer);
        self.require(name)
    }

    /// Appends the features satisfying `predicate` to layer `name` (see
    /// [`Layer::append`]).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the layer is missing or the append is
    /// rejected.
    pub fn append<P>(
        &mut self,
        name: &str,
        features: &[Feature],
        predicate: P,
    ) -> Result<AppendSummary, StoreError>
    where
        P: Fn(&Feature) -> bool,
    {
        self.require_mut(name)?.append(features, predicate)
    }

    /// Reads the given fields of every feature of layer `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the layer or a field is missing.
    pub fn read(&self, name: &str, fields: &[&str]) -> Result<Vec<Row>, StoreError> {
        self.require(name)?.read(fields)
    }

    /// Writes one attribute of one feature.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the layer, feature, or field is missing or
    /// the value does not fit.
    pub fn update_field(
        &mut self,
        name: &str,
        fid: u64,
        field: &str,
        value: FieldValue,
    ) -> Result<(), StoreError> {
        self.require_mut(name)?.update_field(fid, field, value)
    }

    /// Selects features of layer `name` whose `field` equals `value`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the layer or field is missing.
    pub fn select_by_attribute(
        &self,
        name: &str,
        field: &str,
        value: &FieldValue,
    ) -> Result<Selection, StoreError> {
        self.require(name)?.select_by_attribute(field, value)
    }

    /// Removes a layer and its file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the layer is missing or the file cannot be
    /// removed.
    pub fn delete_layer(&mut self, name: &str) -> Result<(), StoreError> {
        let index = self
            .layers
            .iter()
            .position(|l| l.name() == name)
            .ok_or_else(|| StoreError::LayerNotFound(name.to_string()))?;
        self.layers.remove(index);

        let path = self.layer_path(name);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|source| StoreError::Io { path, source })?;
        }
        log::debug!("Deleted layer {name}");
        Ok(())
    }

    /// Writes a single layer to disk.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the layer is missing or cannot be written.
    pub fn save_layer(&self, name: &str) -> Result<(), StoreError> {
        io::write_layer(&self.layer_path(name), self.require(name)?)
    }

    /// Writes every layer to disk.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on the first layer that cannot be written.
    pub fn save(&self) -> Result<(), StoreError> {
        for layer in &self.layers {
            io::write_layer(&self.layer_path(layer.name()), layer)?;
        }
        log::debug!("Saved {} layer(s) to {}", self.layers.len(), self.root.display());
        Ok(())
    }

    /// Path of the file backing layer `name`.
    #[must_use]
    pub fn layer_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{LAYER_EXTENSION}"))
    }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    let invalid = name.is_empty()
        || name.starts_with('.')
        || name.chars().any(|c| {
            matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || c.is_control()
        });
    if invalid {
        Err(StoreError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

/// Layer files directly inside `root`, sorted by file name.
fn layer_files(root: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let io_err = |source| StoreError::Io {
        path: root.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in std::fs::read_dir(root).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        let is_layer = path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(LAYER_EXTENSION));
        if is_layer {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Geometry, Point};
    use muni_merge_layer_models::FieldDef;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("muni_merge_store_{}", uuid::Uuid::new_v4()))
    }

    fn schema() -> LayerSchema {
        LayerSchema::new([
            FieldDef::new("number", FieldType::Integer),
            FieldDef::new("POLY_AREA", FieldType::Integer),
        ])
    }

    #[test]
    fn create_layer_writes_empty_file() {
        let root = temp_root();
        let mut dataset = Dataset::create(&root, true).unwrap();

        let layer = dataset
            .create_layer("Springfield_blocks", GeometryKind::Polygon, &schema(), None)
            .unwrap();
        assert!(layer.is_empty());
        assert!(root.join("Springfield_blocks.geojson").is_file());

        assert!(matches!(
            dataset.create_layer("Springfield_blocks", GeometryKind::Polygon, &schema(), None),
            Err(StoreError::LayerExists(_))
        ));
        assert!(matches!(
            dataset.create_layer("a/b", GeometryKind::Polygon, &schema(), None),
            Err(StoreError::InvalidName(_))
        ));

        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn saved_dataset_reopens_with_same_layers() {
        let root = temp_root();
        let mut dataset = Dataset::create(&root, true).unwrap();
        let buildings = LayerSchema::new([FieldDef::new("bnumber", FieldType::Integer)]);
        dataset
            .create_layer("Springfield_buildings", GeometryKind::Point, &buildings, None)
            .unwrap();
        dataset
            .append(
                "Springfield_buildings",
                &[Feature::new(1, Some(Geometry::Point(Point::new(1.0, 2.0))))
                    .with("bnumber", 101_i64)],
                |_| true,
            )
            .unwrap();
        dataset.save().unwrap();

        let reopened = Dataset::open(&root).unwrap();
        assert_eq!(reopened.layers(), dataset.layers());

        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn opens_layer_holding_the_largest_fid() {
        let root = temp_root();
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(
            root.join("Springfield_buildings.geojson"),
            r#"{"type":"FeatureCollection","features":[
                {"type":"Feature","id":18446744073709551615,"properties":{"bnumber":1},
                 "geometry":{"type":"Point","coordinates":[0,0]}}
            ]}"#,
        )
        .unwrap();

        let mut dataset = Dataset::open(&root).unwrap();
        let buildings = dataset.require("Springfield_buildings").unwrap();
        assert_eq!(buildings.features()[0].fid, u64::MAX);

        let extra = [Feature::new(1, Some(Geometry::Point(Point::new(1.0, 1.0))))];
        assert!(matches!(
            dataset.append("Springfield_buildings", &extra, |_| true),
            Err(StoreError::FidExhausted { .. })
        ));

        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn create_respects_overwrite_flag() {
        let root = temp_root();
        {
            let mut dataset = Dataset::create(&root, true).unwrap();
            dataset
                .create_layer("A_blocks", GeometryKind::Polygon, &schema(), None)
                .unwrap();
        }

        assert!(matches!(
            Dataset::create(&root, false),
            Err(StoreError::DatasetNotEmpty(_))
        ));

        let dataset = Dataset::create(&root, true).unwrap();
        assert!(dataset.layers().is_empty());
        assert!(!root.join("A_blocks.geojson").exists());

        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn delete_layer_removes_file() {
        let root = temp_root();
        let mut dataset = Dataset::create(&root, true).unwrap();
        dataset
            .create_layer("A_blocks", GeometryKind::Polygon, &schema(), None)
            .unwrap();

        dataset.delete_layer("A_blocks").unwrap();
        assert!(dataset.layer("A_blocks").is_none());
        assert!(!root.join("A_blocks.geojson").exists());
        assert!(matches!(
            dataset.delete_layer("A_blocks"),
            Err(StoreError::LayerNotFound(_))
        ));

        std::fs::remove_dir_all(root).unwrap();
    }
}
