//! Source layer discovery.
//!
//! Every immediate child directory of the parent folder is a city folder.
//! Each is walked recursively for layer files; a layer belongs to the city
//! named by the directory that directly contains it, and is merged under
//! the canonical name `{city}_{stem}`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use muni_merge_layer_models::{CanonicalName, Feature, GeometryKind, LayerSchema};
use muni_merge_spatial::GeometryEngine;
use muni_merge_store::io::read_layer;
use muni_merge_store::layer::spatial_ref_name;
use walkdir::WalkDir;

use crate::annotate::annotate;
use crate::config::PipelineConfig;
use crate::{Issue, record};

/// A vector layer loaded from a city folder.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLayer {
    /// File the layer was read from.
    pub path: PathBuf,
    /// Owning city (name of the containing directory).
    pub city: String,
    /// File name including extension.
    pub native_name: String,
    /// Destination layer name.
    pub name: CanonicalName,
    /// Geometry family.
    pub kind: GeometryKind,
    /// Attribute schema, including derived fields once annotated.
    pub schema: LayerSchema,
    /// Spatial reference (`crs` member), copied to the destination.
    pub spatial_ref: Option<serde_json::Value>,
    /// Features in file order.
    pub features: Vec<Feature>,
    /// Whether derived fields were computed.
    pub annotated: bool,
}

impl SourceLayer {
    /// Directory containing the layer file.
    #[must_use]
    pub fn directory(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new(""))
    }

    #[cfg(test)]
    pub(crate) fn for_test(
        city: &str,
        base: &str,
        kind: GeometryKind,
        features: Vec<Feature>,
    ) -> Self {
        let schema = LayerSchema::infer(features.iter().map(|f| &f.attributes));
        Self {
            path: PathBuf::from(city).join(format!("{base}.geojson")),
            city: city.to_string(),
            native_name: format!("{base}.geojson"),
            name: CanonicalName::new(city, base),
            kind,
            schema,
            spatial_ref: None,
            features,
            annotated: false,
        }
    }
}

/// Every source layer found under a parent folder.
#[derive(Debug, Default)]
pub struct Catalog {
    layers: Vec<SourceLayer>,
    folders: Vec<String>,
}

impl Catalog {
    /// Loaded layers in discovery order.
    #[must_use]
    pub fn layers(&self) -> &[SourceLayer] {
        &self.layers
    }

    /// Top-level folders visited, in sorted order (including empty ones).
    #[must_use]
    pub fn folders(&self) -> &[String] {
        &self.folders
    }

    /// Distinct cities that own at least one layer, in discovery order.
    ///
    /// Layers in nested folders belong to their containing directory, so
    /// this can differ from [`Catalog::folders`].
    #[must_use]
    pub fn cities(&self) -> Vec<&str> {
        let mut cities: Vec<&str> = Vec::new();
        for layer in &self.layers {
            if !cities.contains(&layer.city.as_str()) {
                cities.push(&layer.city);
            }
        }
        cities
    }

    /// Number of layers owned by `city`.
    #[must_use]
    pub fn layer_count(&self, city: &str) -> usize {
        self.layers.iter().filter(|l| l.city == city).count()
    }

    /// Source directory → native layer names found directly in it.
    #[must_use]
    pub fn mapping(&self) -> BTreeMap<PathBuf, Vec<String>> {
        let mut mapping: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
        for layer in &self.layers {
            mapping
                .entry(layer.directory().to_path_buf())
                .or_default()
                .push(layer.native_name.clone());
        }
        mapping
    }

    /// Number of layers whose derived fields were computed.
    #[must_use]
    pub fn annotated(&self) -> usize {
        self.layers.iter().filter(|l| l.annotated).count()
    }

    /// Whether nothing was found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Consumes the catalog, yielding its layers.
    #[must_use]
    pub fn into_layers(self) -> Vec<SourceLayer> {
        self.layers
    }
}

/// Catalog plus the recoverable problems met while building it.
#[derive(Debug, Default)]
pub struct CatalogOutcome {
    /// Discovered layers.
    pub catalog: Catalog,
    /// Discovery and annotation failures.
    pub issues: Vec<Issue>,
}

/// Discovers and annotates every layer under `parent`.
///
/// `exclude` is skipped when it is one of the city folders (the destination
/// dataset written inside the parent).
///
/// # Errors
///
/// Returns an I/O error only when `parent` itself cannot be listed. Problems
/// within a city folder become [`Issue::Discovery`] or
/// [`Issue::Annotation`].
pub fn discover(
    parent: &Path,
    config: &PipelineConfig,
    exclude: Option<&Path>,
) -> std::io::Result<CatalogOutcome> {
    let mut outcome = CatalogOutcome::default();

    for folder in list_subfolders(parent, exclude)? {
        let city = folder_name(&folder);
        outcome.catalog.folders.push(city.clone());

        let before = outcome.catalog.layers.len();
        for path in find_layer_files(&folder, config, &mut outcome.issues, &city) {
            match load(&path, config, &mut outcome.issues) {
                Ok(layer) => outcome.catalog.layers.push(layer),
                Err(reason) => record(
                    &mut outcome.issues,
                    Issue::Discovery {
                        city: city.clone(),
                        path: path.clone(),
                        reason,
                    },
                ),
            }
        }

        let found = outcome.catalog.layers.len() - before;
        if found == 0 {
            record(
                &mut outcome.issues,
                Issue::Discovery {
                    city: city.clone(),
                    path: folder.clone(),
                    reason: "no vector layers found".to_string(),
                },
            );
        } else {
            log::info!("{city}: found {found} layer(s)");
        }
    }

    Ok(outcome)
}

/// Immediate child directories of `parent`, sorted, without hidden
/// directories and `exclude`.
fn list_subfolders(parent: &Path, exclude: Option<&Path>) -> std::io::Result<Vec<PathBuf>> {
    let excluded = exclude.and_then(|p| p.canonicalize().ok());

    let mut folders = Vec::new();
    for entry in std::fs::read_dir(parent)? {
        let path = entry?.path();
        if !path.is_dir() || folder_name(&path).starts_with('.') {
            continue;
        }
        if excluded.is_some() && path.canonicalize().ok() == excluded {
            log::debug!("Skipping destination folder {}", path.display());
            continue;
        }
        folders.push(path);
    }
    folders.sort();
    Ok(folders)
}

fn find_layer_files(
    folder: &Path,
    config: &PipelineConfig,
    issues: &mut Vec<Issue>,
    city: &str,
) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let walker = WalkDir::new(folder)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    for entry in walker {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_file() && config.is_layer_file(entry.path()) {
                    files.push(entry.into_path());
                }
            }
            Err(e) => record(
                issues,
                Issue::Discovery {
                    city: city.to_string(),
                    path: e.path().unwrap_or(folder).to_path_buf(),
                    reason: e.to_string(),
                },
            ),
        }
    }
    files
}

fn load(
    path: &Path,
    config: &PipelineConfig,
    issues: &mut Vec<Issue>,
) -> Result<SourceLayer, String> {
    let file = read_layer(path).map_err(|e| e.to_string())?;
    let kind = file.geometry_kind(path).map_err(|e| e.to_string())?;
    let schema = file.schema_or_inferred();

    let city = path.parent().map(folder_name).unwrap_or_default();
    let native_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = CanonicalName::from_native(city.clone(), &native_name);

    let mut layer = SourceLayer {
        path: path.to_path_buf(),
        city,
        native_name,
        name,
        kind,
        schema,
        spatial_ref: file.spatial_ref,
        features: file.features,
        annotated: false,
    };

    let crs = layer.spatial_ref.as_ref().and_then(spatial_ref_name);
    let engine = GeometryEngine::new(config.measure, crs.as_deref());
    if let Err(e) = annotate(&mut layer, &engine) {
        record(
            issues,
            Issue::Annotation {
                layer: layer.name.to_string(),
                reason: e.to_string(),
            },
        );
    }

    log::debug!(
        "Loaded {} ({} {} feature(s)) as {}",
        path.display(),
        layer.features.len(),
        layer.kind,
        layer.name
    );
    Ok(layer)
}

fn folder_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_parent() -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("muni_merge_catalog_{}", uuid::Uuid::new_v4()))
            .join("municipal");
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write(path: &Path, body: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    const ROADS: &str = r#"{"type":"FeatureCollection","features":[
        {"type":"Feature","properties":{"st_name":"Main"},
         "geometry":{"type":"LineString","coordinates":[[0,0],[0,25]]}}
    ]}"#;

    const EMPTY_BLOCKS: &str =
        r#"{"type":"FeatureCollection","geometry_kind":"Polygon","features":[]}"#;

    #[test]
    fn discovers_layers_per_city_and_annotates_them() {
        let parent = temp_parent();
        write(&parent.join("Springfield/roads.geojson"), ROADS);
        write(&parent.join("Springfield/blocks.geojson"), EMPTY_BLOCKS);
        write(&parent.join("Shelbyville/roads.geojson"), ROADS);
        write(&parent.join("notes.geojson"), ROADS);

        let outcome = discover(&parent, &PipelineConfig::default(), None).unwrap();
        let catalog = &outcome.catalog;

        assert!(outcome.issues.is_empty(), "{:?}", outcome.issues);
        assert_eq!(catalog.cities(), ["Shelbyville", "Springfield"]);
        let names: Vec<String> = catalog.layers().iter().map(|l| l.name.to_string()).collect();
        assert_eq!(
            names,
            ["Shelbyville_roads", "Springfield_blocks", "Springfield_roads"]
        );
        assert_eq!(catalog.layer_count("Springfield"), 2);
        assert_eq!(catalog.annotated(), 3);

        let mapping = catalog.mapping();
        assert_eq!(
            mapping[&parent.join("Springfield")],
            vec!["blocks.geojson".to_string(), "roads.geojson".to_string()]
        );

        let roads = &catalog.layers()[0];
        assert_eq!(roads.kind, GeometryKind::Polyline);
        assert_eq!(
            roads.features[0].get(muni_merge_layer_models::LENGTH_FIELD),
            &muni_merge_layer_models::FieldValue::Integer(25)
        );

        std::fs::remove_dir_all(parent.parent().unwrap()).unwrap();
    }

    #[test]
    fn nested_folders_name_their_own_city() {
        let parent = temp_parent();
        write(&parent.join("County/Springfield/roads.geojson"), ROADS);

        write(&parent.join("Region/Springfield/blocks.geojson"), EMPTY_BLOCKS);

        let outcome = discover(&parent, &PipelineConfig::default(), None).unwrap();
        let layer = &outcome.catalog.layers()[0];
        assert_eq!(layer.city, "Springfield");
        assert_eq!(layer.name.to_string(), "Springfield_roads");
        assert_eq!(outcome.catalog.folders(), ["County", "Region"]);
        assert_eq!(outcome.catalog.cities(), ["Springfield"]);

        std::fs::remove_dir_all(parent.parent().unwrap()).unwrap();
    }

    #[test]
    fn skips_destination_and_hidden_folders() {
        let parent = temp_parent();
        let dest = parent.join("municipal_merged");
        write(&dest.join("Springfield_roads.geojson"), ROADS);
        write(&parent.join(".cache/roads.geojson"), ROADS);
        write(&parent.join("Springfield/roads.geojson"), ROADS);

        let outcome = discover(&parent, &PipelineConfig::default(), Some(&dest)).unwrap();
        assert_eq!(outcome.catalog.cities(), ["Springfield"]);
        assert_eq!(outcome.catalog.layers().len(), 1);

        std::fs::remove_dir_all(parent.parent().unwrap()).unwrap();
    }

    #[test]
    fn bad_files_and_empty_folders_are_issues() {
        let parent = temp_parent();
        write(&parent.join("Springfield/roads.geojson"), "not json");
        write(&parent.join("Springfield/blocks.geojson"), EMPTY_BLOCKS);
        std::fs::create_dir_all(parent.join("Ghosttown")).unwrap();

        let outcome = discover(&parent, &PipelineConfig::default(), None).unwrap();
        assert_eq!(outcome.catalog.layers().len(), 1);
        assert_eq!(outcome.issues.len(), 2);
        assert!(
            outcome
                .issues
                .iter()
                .all(|i| matches!(i, Issue::Discovery { .. }))
        );

        std::fs::remove_dir_all(parent.parent().unwrap()).unwrap();
    }

    #[test]
    fn unannotatable_layer_is_still_cataloged() {
        let parent = temp_parent();
        write(
            &parent.join("Springfield/roads.geojson"),
            r#"{"type":"FeatureCollection","geometry_kind":"Polyline","features":[
                {"type":"Feature","properties":{"st_name":"Main"},"geometry":null}
            ]}"#,
        );

        let outcome = discover(&parent, &PipelineConfig::default(), None).unwrap();
        assert_eq!(outcome.catalog.layers().len(), 1);
        assert_eq!(outcome.catalog.annotated(), 0);
        assert!(matches!(outcome.issues[0], Issue::Annotation { .. }));

        std::fs::remove_dir_all(parent.parent().unwrap()).unwrap();
    }

    #[test]
    fn unreadable_parent_is_an_error() {
        let missing =
            std::env::temp_dir().join(format!("muni_merge_missing_{}", uuid::Uuid::new_v4()));
        assert!(discover(&missing, &PipelineConfig::default(), None).is_err());
    }
}
