//! Pipeline configuration.
//!
//! Every setting has a default matching the municipal data contract
//! (`bnumber`/`height`/`apartments` on buildings, `st_name` on roads,
//! `number` on blocks). A TOML file can override any subset:
//!
//! ```toml
//! overwrite = false
//! measure = "geodesic"
//!
//! [fields]
//! building_number = "BLDG_NO"
//!
//! [road_length]
//! min = 5.0
//! ```

use std::path::{Path, PathBuf};

use muni_merge_spatial::Measure;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("cannot read config {path}: {source}")]
    Io {
        /// Config file path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`PipelineConfig`].
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The values parse but contradict each other.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Attribute field names consulted by admission and linkage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldNames {
    /// Building number on building points; also the building id written
    /// into `new_number`.
    pub building_number: String,
    /// Building height.
    pub height: String,
    /// Apartment count.
    pub apartments: String,
    /// Street name on road polylines.
    pub street_name: String,
    /// Block number on block polygons.
    pub block_number: String,
}

impl Default for FieldNames {
    fn default() -> Self {
        Self {
            building_number: "bnumber".to_string(),
            height: "height".to_string(),
            apartments: "apartments".to_string(),
            street_name: "st_name".to_string(),
            block_number: "number".to_string(),
        }
    }
}

/// Exclusive bounds (meters) a road's `LENGTH` must fall between.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LengthBounds {
    /// Lengths at or below this are slivers.
    pub min: f64,
    /// Lengths at or above this are artifacts.
    pub max: f64,
}

impl Default for LengthBounds {
    fn default() -> Self {
        Self {
            min: 10.0,
            max: 500.0,
        }
    }
}

/// Case-insensitive substrings identifying building and block layers by
/// name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingKeywords {
    /// Marks a building layer.
    pub buildings: String,
    /// Marks a block layer.
    pub blocks: String,
}

impl Default for PairingKeywords {
    fn default() -> Self {
        Self {
            buildings: "buildings".to_string(),
            blocks: "blocks".to_string(),
        }
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Destination dataset directory. Defaults to
    /// `{parent}/{parent_name}_merged`.
    pub output_dir: Option<PathBuf>,
    /// Replace layers of an existing destination dataset.
    pub overwrite: bool,
    /// File extensions (without dot) recognised as vector layers.
    pub layer_extensions: Vec<String>,
    /// How lengths and areas are measured.
    pub measure: Measure,
    /// Attribute field names.
    pub fields: FieldNames,
    /// Admission bounds for road lengths.
    pub road_length: LengthBounds,
    /// Layer name keywords used when pairing.
    pub keywords: PairingKeywords,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            overwrite: true,
            layer_extensions: vec!["geojson".to_string()],
            measure: Measure::Auto,
            fields: FieldNames::default(),
            road_length: LengthBounds::default(),
            keywords: PairingKeywords::default(),
        }
    }
}

impl PipelineConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the document does not parse or fails
    /// validation.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, does not parse,
    /// or fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Loaded config from {}", path.display());
        Self::from_toml_str(&contents)
    }

    /// Checks values that deserialize fine but cannot work together.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.road_length.min >= self.road_length.max {
            return Err(ConfigError::Invalid(format!(
                "road_length.min ({}) must be below road_length.max ({})",
                self.road_length.min, self.road_length.max
            )));
        }
        if self.layer_extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "layer_extensions must not be empty".to_string(),
            ));
        }
        if self.keywords.buildings.trim().is_empty() || self.keywords.blocks.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "pairing keywords must not be blank".to_string(),
            ));
        }
        if self
            .keywords
            .buildings
            .eq_ignore_ascii_case(&self.keywords.blocks)
        {
            return Err(ConfigError::Invalid(
                "pairing keywords for buildings and blocks must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// Destination dataset directory for a parent folder.
    #[must_use]
    pub fn dataset_dir(&self, parent: &Path) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(|| {
            let parent_name = parent
                .file_name()
                .map_or_else(|| "dataset".to_string(), |n| n.to_string_lossy().into_owned());
            parent.join(format!("{parent_name}_merged"))
        })
    }

    /// Whether `path` has one of the configured layer extensions.
    #[must_use]
    pub fn is_layer_file(&self, path: &Path) -> bool {
        path.extension().is_some_and(|ext| {
            self.layer_extensions
                .iter()
                .any(|wanted| ext.eq_ignore_ascii_case(wanted.trim_start_matches('.')))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.fields.building_number, "bnumber");
        assert!((config.road_length.max - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_overrides_keep_other_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            measure = "planar"

            [fields]
            block_number = "BLOCK_NO"

            [road_length]
            min = 5.0
            "#,
        )
        .unwrap();

        assert_eq!(config.measure, Measure::Planar);
        assert_eq!(config.fields.block_number, "BLOCK_NO");
        assert_eq!(config.fields.street_name, "st_name");
        assert!((config.road_length.min - 5.0).abs() < f64::EPSILON);
        assert!((config.road_length.max - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_inverted_length_bounds() {
        let err = PipelineConfig::from_toml_str("[road_length]\nmin = 600.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_identical_keywords() {
        let err = PipelineConfig::from_toml_str("[keywords]\nbuildings = \"x\"\nblocks = \"X\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn default_dataset_dir_lives_under_parent() {
        let config = PipelineConfig::default();
        assert_eq!(
            config.dataset_dir(Path::new("/data/municipal")),
            PathBuf::from("/data/municipal/municipal_merged")
        );
    }

    #[test]
    fn layer_extension_match_ignores_case_and_dot() {
        let config = PipelineConfig {
            layer_extensions: vec![".GeoJSON".to_string(), "json".to_string()],
            ..PipelineConfig::default()
        };
        assert!(config.is_layer_file(Path::new("a/roads.geojson")));
        assert!(config.is_layer_file(Path::new("a/roads.JSON")));
        assert!(!config.is_layer_file(Path::new("a/roads.shp")));
    }
}
