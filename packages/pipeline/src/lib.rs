#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Consolidates per-city vector layers into one dataset.
//!
//! A run walks a parent folder of city folders and goes through these
//! phases, each finishing before the next starts:
//!
//! 1. **Discover** every layer file and annotate it with derived geometry
//!    fields ([`catalog`], [`annotate`]).
//! 2. **Template** one empty destination layer per canonical name
//!    ([`template`]).
//! 3. **Merge** features that pass their admission predicate ([`merge`],
//!    [`admission`]).
//! 4. **Pair** each city's buildings layer with its blocks layer
//!    ([`pair`]).
//! 5. **Link** buildings to the blocks they intersect, writing
//!    `new_number` ([`link`]).
//!
//! Problems confined to one folder, layer, city or block are collected as
//! [`Issue`]s and never stop the run.

pub mod admission;
pub mod annotate;
pub mod catalog;
pub mod config;
pub mod link;
pub mod merge;
pub mod pair;
pub mod progress;
pub mod report;
pub mod template;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use muni_merge_layer_models::CanonicalName;
use muni_merge_store::{Dataset, MemoryWorkspace, StoreError};
use serde::Serialize;
use strum_macros::{AsRefStr, Display};
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::pair::LayerPair;
use crate::progress::{ProgressCallback, null_progress};
use crate::report::RunReport;
use crate::template::DestinationLayer;

/// A recoverable failure. The run reports it and carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Issue {
    /// A city folder or layer file could not be cataloged.
    #[error("{city}: cannot catalog {path}: {reason}")]
    Discovery {
        /// City folder name.
        city: String,
        /// Folder or file involved.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Derived fields of a layer could not be computed.
    #[error("cannot annotate {layer}: {reason}")]
    Annotation {
        /// Canonical layer name.
        layer: String,
        /// What went wrong.
        reason: String,
    },

    /// A destination layer could not be created.
    #[error("cannot create destination {layer}: {reason}")]
    SchemaCreation {
        /// Canonical layer name.
        layer: String,
        /// What went wrong.
        reason: String,
    },

    /// A source layer could not be appended to its destination.
    #[error("cannot merge {source_layer} into {destination}: {reason}")]
    Merge {
        /// Source layer file.
        source_layer: String,
        /// Destination layer name.
        destination: String,
        /// What went wrong.
        reason: String,
    },

    /// A city's buildings and blocks layers could not be paired.
    #[error("{city}: cannot pair layers: {reason}")]
    Pairing {
        /// City name.
        city: String,
        /// What went wrong.
        reason: String,
    },

    /// Linkage failed for a city, or for one of its blocks.
    #[error("{city}: cannot link block {}: {reason}", .block.as_deref().unwrap_or("*"))]
    Linkage {
        /// City name.
        city: String,
        /// Block number, `None` when the whole city failed.
        block: Option<String>,
        /// What went wrong.
        reason: String,
    },
}

/// Logs `issue` and keeps it for the report.
pub(crate) fn record(issues: &mut Vec<Issue>, issue: Issue) {
    log::warn!("{issue}");
    issues.push(issue);
}

/// Stages of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    /// Layer discovery and annotation.
    Discover,
    /// Destination layer creation.
    Template,
    /// Filtered append.
    Merge,
    /// Buildings/blocks pairing.
    Pair,
    /// Spatial linkage.
    Link,
    /// Writing the dataset.
    Save,
}

impl Phase {
    /// Phases of a full run.
    pub const RUN: &[Self] = &[
        Self::Discover,
        Self::Template,
        Self::Merge,
        Self::Pair,
        Self::Link,
        Self::Save,
    ];
}

/// Errors that abort a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The destination dataset could not be prepared.
    #[error("cannot set up dataset {path}: {source}")]
    Setup {
        /// Dataset directory.
        path: PathBuf,
        /// Underlying error.
        source: StoreError,
    },

    /// The parent folder could not be listed.
    #[error("cannot read parent folder {path}: {source}")]
    ParentUnreadable {
        /// Parent folder.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The run was cancelled before `phase` started.
    #[error("cancelled before {phase}")]
    Cancelled {
        /// Phase that did not start.
        phase: Phase,
    },

    /// The dataset could not be written.
    #[error("cannot save dataset: {0}")]
    Save(#[source] StoreError),
}

/// Shared flag requesting a run to stop at its next phase boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates an unset token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fails with [`PipelineError::Cancelled`] when cancellation was
    /// requested.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Cancelled`] naming `phase`.
    pub fn check(&self, phase: Phase) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            log::warn!("Cancellation requested, stopping before {phase}");
            return Err(PipelineError::Cancelled { phase });
        }
        Ok(())
    }
}

/// Runs consolidation with one configuration.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    /// Creates a pipeline.
    #[must_use]
    pub const fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Consolidates every city folder under `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if the parent cannot be read, the dataset
    /// cannot be created or saved, or `cancel` fires.
    pub fn run(
        &self,
        parent: &Path,
        progress: Option<&Arc<dyn ProgressCallback>>,
        cancel: &CancelToken,
    ) -> Result<RunReport, PipelineError> {
        let start = Instant::now();
        let progress = progress.cloned().unwrap_or_else(null_progress);
        progress.set_total(Phase::RUN.len() as u64);

        let dataset_dir = self.config.dataset_dir(parent);
        log::info!(
            "Consolidating {} into {}",
            parent.display(),
            dataset_dir.display()
        );

        cancel.check(Phase::Discover)?;
        if let Err(source) = std::fs::read_dir(parent) {
            return Err(PipelineError::ParentUnreadable {
                path: parent.to_path_buf(),
                source,
            });
        }
        let mut dataset =
            Dataset::create(&dataset_dir, self.config.overwrite).map_err(|source| {
                PipelineError::Setup {
                    path: dataset_dir.clone(),
                    source,
                }
            })?;

        let mut report = RunReport {
            dataset: dataset_dir.clone(),
            ..RunReport::default()
        };

        progress.set_message(Phase::Discover.to_string());
        let catalog = catalog::discover(parent, &self.config, Some(&dataset_dir)).map_err(
            |source| PipelineError::ParentUnreadable {
                path: parent.to_path_buf(),
                source,
            },
        )?;
        report.cities = catalog.catalog.cities().len() as u64;
        log::debug!(
            "Scanned {} folder(s), found {} city(ies)",
            catalog.catalog.folders().len(),
            report.cities
        );
        report.source_layers = catalog.catalog.layers().len() as u64;
        report.annotated_layers = catalog.catalog.annotated() as u64;
        report.issues.extend(catalog.issues);
        let sources = catalog.catalog.into_layers();
        progress.inc(1);

        cancel.check(Phase::Template)?;
        progress.set_message(Phase::Template.to_string());
        let templates = template::create_destinations(&mut dataset, &sources);
        report.destinations_created = templates.destinations.len() as u64;
        report.issues.extend(templates.issues);
        progress.inc(1);

        cancel.check(Phase::Merge)?;
        progress.set_message(Phase::Merge.to_string());
        let merged = merge::merge_all(&mut dataset, &sources, &self.config);
        report.layers_merged = merged.layers_merged;
        report.features_admitted = merged.admitted;
        report.features_rejected = merged.rejected;
        report.issues.extend(merged.issues);
        dataset.save().map_err(PipelineError::Save)?;
        progress.inc(1);

        self.pair_and_link(
            &mut dataset,
            &templates.destinations,
            &mut report,
            &progress,
            cancel,
        )?;

        report.elapsed_secs = start.elapsed().as_secs_f64();
        progress.finish(format!(
            "{} layer(s) merged, {} building(s) linked",
            report.layers_merged, report.buildings_linked
        ));
        report.log_summary();
        Ok(report)
    }

    /// Re-runs pairing and linkage on an already consolidated dataset.
    ///
    /// City and layer kind are recovered from each layer's canonical name.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if the dataset cannot be opened or saved,
    /// or `cancel` fires.
    pub fn link_existing(
        &self,
        dataset_dir: &Path,
        progress: Option<&Arc<dyn ProgressCallback>>,
        cancel: &CancelToken,
    ) -> Result<RunReport, PipelineError> {
        let start = Instant::now();
        let progress = progress.cloned().unwrap_or_else(null_progress);
        progress.set_total(3);

        let mut dataset = Dataset::open(dataset_dir).map_err(|source| PipelineError::Setup {
            path: dataset_dir.to_path_buf(),
            source,
        })?;

        let mut report = RunReport {
            dataset: dataset_dir.to_path_buf(),
            ..RunReport::default()
        };

        let mut destinations = Vec::new();
        for layer in dataset.layers() {
            match CanonicalName::parse(layer.name()) {
                Some(name) => destinations.push(DestinationLayer {
                    name,
                    kind: layer.kind(),
                }),
                None => record(
                    &mut report.issues,
                    Issue::Pairing {
                        city: layer.name().to_string(),
                        reason: "layer name is not of the form {city}_{layer}".to_string(),
                    },
                ),
            }
        }

        self.pair_and_link(&mut dataset, &destinations, &mut report, &progress, cancel)?;

        report.elapsed_secs = start.elapsed().as_secs_f64();
        progress.finish(format!("{} building(s) linked", report.buildings_linked));
        report.log_summary();
        Ok(report)
    }

    fn pair_and_link(
        &self,
        dataset: &mut Dataset,
        destinations: &[DestinationLayer],
        report: &mut RunReport,
        progress: &Arc<dyn ProgressCallback>,
        cancel: &CancelToken,
    ) -> Result<(), PipelineError> {
        cancel.check(Phase::Pair)?;
        progress.set_message(Phase::Pair.to_string());
        let paired = pair::pair_layers(destinations, &self.config.keywords);
        report.pairs = paired.pairs.len() as u64;
        report.issues.extend(paired.issues);
        progress.inc(1);

        cancel.check(Phase::Link)?;
        progress.set_message(Phase::Link.to_string());
        let mut workspace = MemoryWorkspace::new();
        for pair in &paired.pairs {
            self.link_pair(dataset, &mut workspace, pair, report);
        }
        debug_assert!(workspace.is_empty());
        progress.inc(1);

        cancel.check(Phase::Save)?;
        progress.set_message(Phase::Save.to_string());
        dataset.save().map_err(PipelineError::Save)?;
        progress.inc(1);
        Ok(())
    }

    fn link_pair(
        &self,
        dataset: &mut Dataset,
        workspace: &mut MemoryWorkspace,
        pair: &LayerPair,
        report: &mut RunReport,
    ) {
        let linked = link::link(dataset, workspace, pair, &self.config.fields);
        report.blocks_processed += linked.blocks_processed;
        report.buildings_linked += linked.buildings_linked;
        report.buildings_overwritten += linked.buildings_overwritten;
        report.issues.extend(linked.issues);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muni_merge_layer_models::{FieldValue, NEW_NUMBER_FIELD};

    fn temp_parent() -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("muni_merge_pipeline_{}", uuid::Uuid::new_v4()))
            .join("municipal");
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write(path: &Path, body: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    const BUILDINGS: &str = r#"{"type":"FeatureCollection","features":[
        {"type":"Feature","properties":{"bnumber":101,"height":9,"apartments":4},
         "geometry":{"type":"Point","coordinates":[2,2]}},
        {"type":"Feature","properties":{"bnumber":102,"height":12.5,"apartments":6},
         "geometry":{"type":"Point","coordinates":[8,8]}},
        {"type":"Feature","properties":{"bnumber":103,"height":0,"apartments":6},
         "geometry":{"type":"Point","coordinates":[5,5]}}
    ]}"#;

    const BLOCKS: &str = r#"{"type":"FeatureCollection","features":[
        {"type":"Feature","properties":{"number":7},
         "geometry":{"type":"Polygon","coordinates":[[[0,0],[10,0],[10,10],[0,10],[0,0]]]}}
    ]}"#;

    const ROADS: &str = r#"{"type":"FeatureCollection","features":[
        {"type":"Feature","properties":{"st_name":"Short Ln"},
         "geometry":{"type":"LineString","coordinates":[[0,0],[0,8]]}},
        {"type":"Feature","properties":{"st_name":"Main St"},
         "geometry":{"type":"LineString","coordinates":[[0,0],[0,450]]}}
    ]}"#;

    fn springfield(parent: &Path) {
        write(&parent.join("Springfield/buildings.geojson"), BUILDINGS);
        write(&parent.join("Springfield/blocks.geojson"), BLOCKS);
        write(&parent.join("Springfield/roads.geojson"), ROADS);
    }

    #[test]
    fn full_run_merges_and_links() {
        let parent = temp_parent();
        springfield(&parent);
        write(&parent.join("Shelbyville/roads.geojson"), ROADS);

        let report = Pipeline::default()
            .run(&parent, None, &CancelToken::new())
            .unwrap();

        assert!(report.is_clean(), "{:?}", report.issues);
        assert_eq!(report.cities, 2);
        assert_eq!(report.source_layers, 4);
        assert_eq!(report.destinations_created, 4);
        assert_eq!(report.features_admitted, 2 + 1 + 1 + 1);
        assert_eq!(report.features_rejected, 1 + 1 + 1);
        assert_eq!(report.pairs, 1);
        assert_eq!(report.buildings_linked, 2);

        let dataset = Dataset::open(&parent.join("municipal_merged")).unwrap();
        let buildings = dataset.require("Springfield_buildings").unwrap();
        let numbers: Vec<&FieldValue> = buildings
            .features()
            .iter()
            .map(|f| f.get(NEW_NUMBER_FIELD))
            .collect();
        assert_eq!(
            numbers,
            [&FieldValue::from("BL7#101"), &FieldValue::from("BL7#102")]
        );
        assert_eq!(dataset.require("Shelbyville_roads").unwrap().len(), 1);

        std::fs::remove_dir_all(parent.parent().unwrap()).unwrap();
    }

    #[test]
    fn same_city_in_two_folders_keeps_admitted_values() {
        let parent = temp_parent();
        write(
            &parent.join("CountyA/Springfield/buildings.geojson"),
            r#"{"type":"FeatureCollection","features":[
                {"type":"Feature","properties":{"bnumber":1,"height":9,"apartments":2},
                 "geometry":{"type":"Point","coordinates":[1,1]}}
            ]}"#,
        );
        write(
            &parent.join("CountyB/Springfield/buildings.geojson"),
            r#"{"type":"FeatureCollection","features":[
                {"type":"Feature","properties":{"bnumber":2,"height":12.5,"apartments":3},
                 "geometry":{"type":"Point","coordinates":[2,2]}}
            ]}"#,
        );

        let report = Pipeline::default()
            .run(&parent, None, &CancelToken::new())
            .unwrap();

        assert_eq!(report.cities, 1);
        assert_eq!(report.source_layers, 2);
        assert_eq!(report.destinations_created, 1);
        assert_eq!(report.features_admitted, 2);
        assert!(
            !report
                .issues
                .iter()
                .any(|issue| matches!(issue, Issue::Merge { .. }))
        );

        let dataset = Dataset::open(&parent.join("municipal_merged")).unwrap();
        let heights: Vec<&FieldValue> = dataset
            .require("Springfield_buildings")
            .unwrap()
            .features()
            .iter()
            .map(|f| f.get("height"))
            .collect();
        assert_eq!(heights, [&FieldValue::Real(9.0), &FieldValue::Real(12.5)]);

        std::fs::remove_dir_all(parent.parent().unwrap()).unwrap();
    }

    #[test]
    fn rerun_skips_its_own_output() {
        let parent = temp_parent();
        springfield(&parent);

        let pipeline = Pipeline::default();
        pipeline.run(&parent, None, &CancelToken::new()).unwrap();
        let second = pipeline.run(&parent, None, &CancelToken::new()).unwrap();

        assert_eq!(second.cities, 1);
        assert_eq!(second.source_layers, 3);

        std::fs::remove_dir_all(parent.parent().unwrap()).unwrap();
    }

    #[test]
    fn cancelled_run_stops_before_discovery() {
        let parent = temp_parent();
        springfield(&parent);

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = Pipeline::default().run(&parent, None, &cancel).unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Cancelled {
                phase: Phase::Discover
            }
        ));
        assert!(!parent.join("municipal_merged").exists());

        std::fs::remove_dir_all(parent.parent().unwrap()).unwrap();
    }

    #[test]
    fn missing_parent_is_fatal() {
        let parent =
            std::env::temp_dir().join(format!("muni_merge_absent_{}", uuid::Uuid::new_v4()));
        let err = Pipeline::default()
            .run(&parent, None, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, PipelineError::ParentUnreadable { .. }));
    }

    #[test]
    fn relinks_an_existing_dataset() {
        let parent = temp_parent();
        springfield(&parent);
        let pipeline = Pipeline::default();
        pipeline.run(&parent, None, &CancelToken::new()).unwrap();

        let dataset_dir = parent.join("municipal_merged");
        let mut dataset = Dataset::open(&dataset_dir).unwrap();
        let fids: Vec<u64> = dataset
            .require("Springfield_buildings")
            .unwrap()
            .features()
            .iter()
            .map(|f| f.fid)
            .collect();
        for fid in fids {
            dataset
                .update_field("Springfield_buildings", fid, NEW_NUMBER_FIELD, FieldValue::Null)
                .unwrap();
        }
        dataset.save().unwrap();

        let report = pipeline
            .link_existing(&dataset_dir, None, &CancelToken::new())
            .unwrap();
        assert_eq!(report.pairs, 1);
        assert_eq!(report.buildings_linked, 2);

        let dataset = Dataset::open(&dataset_dir).unwrap();
        let buildings = dataset.require("Springfield_buildings").unwrap();
        assert_eq!(
            buildings.features()[0].get(NEW_NUMBER_FIELD),
            &FieldValue::from("BL7#101")
        );

        std::fs::remove_dir_all(parent.parent().unwrap()).unwrap();
    }

    #[test]
    fn progress_sees_every_phase() {
        use std::sync::Mutex;

        #[derive(Default)]
        struct Recorder {
            messages: Mutex<Vec<String>>,
            total: Mutex<u64>,
            done: Mutex<u64>,
        }

        impl ProgressCallback for Recorder {
            fn set_total(&self, total: u64) {
                *self.total.lock().unwrap() = total;
            }
            fn inc(&self, delta: u64) {
                *self.done.lock().unwrap() += delta;
            }
            fn set_message(&self, msg: String) {
                self.messages.lock().unwrap().push(msg);
            }
            fn finish(&self, _msg: String) {}
        }

        let parent = temp_parent();
        springfield(&parent);
        let recorder = Arc::new(Recorder::default());
        let progress: Arc<dyn ProgressCallback> = recorder.clone();

        Pipeline::default()
            .run(&parent, Some(&progress), &CancelToken::new())
            .unwrap();

        assert_eq!(*recorder.total.lock().unwrap(), 6);
        assert_eq!(*recorder.done.lock().unwrap(), 6);
        assert_eq!(
            *recorder.messages.lock().unwrap(),
            ["discover", "template", "merge", "pair", "link", "save"]
        );

        std::fs::remove_dir_all(parent.parent().unwrap()).unwrap();
    }
}
