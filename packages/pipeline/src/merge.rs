//! Filtered append of source features into their destination layers.

use muni_merge_store::Dataset;

use crate::admission::AdmissionPredicate;
use crate::catalog::SourceLayer;
use crate::config::PipelineConfig;
use crate::{Issue, record};

/// Totals of a merge phase.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Source layers appended successfully.
    pub layers_merged: u64,
    /// Features that met their predicate and were written.
    pub admitted: u64,
    /// Features dropped by their predicate.
    pub rejected: u64,
    /// Layers that could not be merged.
    pub issues: Vec<Issue>,
}

/// Appends every source layer to the destination with the same canonical
/// name and geometry kind, keeping only features that pass the kind's
/// [`AdmissionPredicate`].
///
/// The predicate is evaluated on each feature as mapped into the
/// destination schema, so a value that does not survive the mapping
/// cannot satisfy it.
pub fn merge_all(
    dataset: &mut Dataset,
    sources: &[SourceLayer],
    config: &PipelineConfig,
) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();

    for source in sources {
        let destination = source.name.to_string();

        let matches = dataset
            .layer(&destination)
            .is_some_and(|layer| layer.kind() == source.kind);
        if !matches {
            record(
                &mut outcome.issues,
                Issue::Merge {
                    source_layer: source.path.display().to_string(),
                    destination,
                    reason: format!("no {} destination layer with this name", source.kind),
                },
            );
            continue;
        }

        let predicate =
            AdmissionPredicate::for_kind(source.kind, &config.fields, &config.road_length);
        match dataset.append(&destination, &source.features, |f| predicate.admits(f)) {
            Ok(summary) => {
                log::info!(
                    "Merged {} into {destination}: {} admitted, {} rejected by [{predicate}]",
                    source.native_name,
                    summary.admitted,
                    summary.rejected
                );
                outcome.layers_merged += 1;
                outcome.admitted += summary.admitted;
                outcome.rejected += summary.rejected;
            }
            Err(e) => record(
                &mut outcome.issues,
                Issue::Merge {
                    source_layer: source.path.display().to_string(),
                    destination,
                    reason: e.to_string(),
                },
            ),
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::annotate;
    use geo::{Geometry, LineString, Point};
    use muni_merge_layer_models::{Feature, FieldValue, GeometryKind, LENGTH_FIELD};
    use muni_merge_spatial::{GeometryEngine, Measure};

    fn temp_dataset() -> Dataset {
        let root =
            std::env::temp_dir().join(format!("muni_merge_merge_{}", uuid::Uuid::new_v4()));
        Dataset::create(&root, true).unwrap()
    }

    fn road(fid: u64, name: &str, len: f64) -> Feature {
        Feature::new(
            fid,
            Some(Geometry::LineString(LineString::from(vec![(0.0, 0.0), (0.0, len)]))),
        )
        .with("st_name", name)
    }

    fn roads_layer() -> SourceLayer {
        let mut layer = SourceLayer::for_test(
            "Springfield",
            "roads",
            GeometryKind::Polyline,
            vec![
                road(1, "Short Ln", 8.0),
                road(2, "Main St", 450.0),
                road(3, "", 100.0),
            ],
        );
        annotate(&mut layer, &GeometryEngine::new(Measure::Planar, None)).unwrap();
        layer
    }

    #[test]
    fn only_admitted_roads_are_appended() {
        let mut dataset = temp_dataset();
        let roads = roads_layer();
        dataset
            .create_layer("Springfield_roads", roads.kind, &roads.schema, None)
            .unwrap();

        let outcome = merge_all(&mut dataset, &[roads], &PipelineConfig::default());
        assert!(outcome.issues.is_empty());
        assert_eq!((outcome.admitted, outcome.rejected), (1, 2));

        let merged = dataset.require("Springfield_roads").unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.features()[0].get("st_name"), &FieldValue::from("Main St"));
        assert_eq!(merged.features()[0].get(LENGTH_FIELD), &FieldValue::Integer(450));

        std::fs::remove_dir_all(dataset.root()).unwrap();
    }

    #[test]
    fn missing_destination_is_recoverable() {
        let mut dataset = temp_dataset();
        let roads = roads_layer();
        let mut blocks =
            SourceLayer::for_test("Springfield", "blocks", GeometryKind::Polygon, vec![]);
        blocks.schema.upsert(muni_merge_layer_models::FieldDef::new(
            "number",
            muni_merge_layer_models::FieldType::Integer,
        ));
        dataset
            .create_layer("Springfield_blocks", blocks.kind, &blocks.schema, None)
            .unwrap();

        let outcome = merge_all(&mut dataset, &[roads, blocks], &PipelineConfig::default());
        assert_eq!(outcome.layers_merged, 1);
        assert!(matches!(
            &outcome.issues[..],
            [Issue::Merge { destination, .. }] if destination == "Springfield_roads"
        ));

        std::fs::remove_dir_all(dataset.root()).unwrap();
    }

    #[test]
    fn geometry_mismatch_rejects_the_whole_layer() {
        let mut dataset = temp_dataset();
        let mut buildings = SourceLayer::for_test(
            "Springfield",
            "buildings",
            GeometryKind::Point,
            vec![
                Feature::new(1, Some(Geometry::Point(Point::new(0.0, 0.0)))),
                Feature::new(
                    2,
                    Some(Geometry::LineString(LineString::from(vec![(0.0, 0.0), (1.0, 0.0)]))),
                ),
            ],
        );
        for feature in &mut buildings.features {
            feature.set("bnumber", 1_i64);
            feature.set("height", 3_i64);
            feature.set("apartments", 2_i64);
        }
        buildings.schema = muni_merge_layer_models::LayerSchema::infer(
            buildings.features.iter().map(|f| &f.attributes),
        );
        dataset
            .create_layer("Springfield_buildings", buildings.kind, &buildings.schema, None)
            .unwrap();

        let outcome = merge_all(&mut dataset, &[buildings], &PipelineConfig::default());
        assert_eq!(outcome.issues.len(), 1);
        assert!(dataset.require("Springfield_buildings").unwrap().is_empty());

        std::fs::remove_dir_all(dataset.root()).unwrap();
    }
}
