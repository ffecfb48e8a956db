//! Derived geometry attributes.
//!
//! Every source layer gets the fields of its kind (`LENGTH`, `POINT_X` /
//! `POINT_Y` / `new_number`, or `POLY_AREA`) before it is merged. Values are
//! truncated toward zero and stored as integers.

use muni_merge_layer_models::{
    Feature, GeometryKind, LENGTH_FIELD, POINT_X_FIELD, POINT_Y_FIELD, POLY_AREA_FIELD,
};
use muni_merge_spatial::{GeometryEngine, SpatialError};
use thiserror::Error;

use crate::catalog::SourceLayer;

/// Errors that prevent a layer from being annotated.
#[derive(Debug, Error)]
pub enum AnnotateError {
    /// A feature carries no geometry.
    #[error("feature {fid} has no geometry")]
    MissingGeometry {
        /// Offending feature id.
        fid: u64,
    },

    /// The measurement of a feature failed.
    #[error("feature {fid}: {source}")]
    Measurement {
        /// Offending feature id.
        fid: u64,
        /// Underlying error.
        source: SpatialError,
    },

    /// The measurement does not fit an integer field.
    #[error("feature {fid}: value {value} is out of range")]
    OutOfRange {
        /// Offending feature id.
        fid: u64,
        /// Measured value.
        value: f64,
    },
}

/// Outcome of a successful annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnotationSummary {
    /// Features whose derived fields were written.
    pub features: u64,
}

enum Metric {
    Length(i64),
    Coordinates(i64, i64),
    Area(i64),
}

/// Adds and computes the derived fields of `layer`.
///
/// The derived fields are added to the schema unconditionally. Values are
/// then computed for every feature before any is written, so a failure
/// leaves all features untouched (their derived fields read as null).
/// Existing `new_number` values are preserved.
///
/// # Errors
///
/// Returns [`AnnotateError`] for the first feature that cannot be measured.
pub fn annotate(
    layer: &mut SourceLayer,
    engine: &GeometryEngine,
) -> Result<AnnotationSummary, AnnotateError> {
    for field in layer.kind.derived_fields() {
        layer.schema.upsert(field);
    }

    let metrics = layer
        .features
        .iter()
        .map(|feature| measure(layer.kind, feature, engine))
        .collect::<Result<Vec<_>, _>>()?;

    for (feature, metric) in layer.features.iter_mut().zip(metrics) {
        match metric {
            Metric::Length(length) => feature.set(LENGTH_FIELD, length),
            Metric::Coordinates(x, y) => {
                feature.set(POINT_X_FIELD, x);
                feature.set(POINT_Y_FIELD, y);
            }
            Metric::Area(area) => feature.set(POLY_AREA_FIELD, area),
        }
    }

    layer.annotated = true;
    log::debug!(
        "Annotated {} feature(s) of {} using {} measure",
        layer.features.len(),
        layer.name,
        engine.measure()
    );

    Ok(AnnotationSummary {
        features: layer.features.len() as u64,
    })
}

fn measure(
    kind: GeometryKind,
    feature: &Feature,
    engine: &GeometryEngine,
) -> Result<Metric, AnnotateError> {
    let fid = feature.fid;
    let geometry = feature
        .geometry
        .as_ref()
        .ok_or(AnnotateError::MissingGeometry { fid })?;
    let measured = |source| AnnotateError::Measurement { fid, source };

    Ok(match kind {
        GeometryKind::Polyline => {
            Metric::Length(truncate(fid, engine.length(geometry).map_err(measured)?)?)
        }
        GeometryKind::Point => {
            let (x, y) = engine.centroid(geometry).map_err(measured)?;
            Metric::Coordinates(truncate(fid, x)?, truncate(fid, y)?)
        }
        GeometryKind::Polygon => {
            Metric::Area(truncate(fid, engine.area(geometry).map_err(measured)?)?)
        }
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn truncate(fid: u64, value: f64) -> Result<i64, AnnotateError> {
    let truncated = value.trunc();
    if truncated.is_finite() && truncated.abs() < i64::MAX as f64 {
        Ok(truncated as i64)
    } else {
        Err(AnnotateError::OutOfRange { fid, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Geometry, LineString, MultiPoint, Point, polygon};
    use muni_merge_layer_models::{FieldType, FieldValue, LayerSchema, NEW_NUMBER_FIELD};
    use muni_merge_spatial::Measure;

    fn derived_value(feature: &Feature, field: &str) -> Option<i64> {
        match feature.get(field) {
            FieldValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    fn planar() -> GeometryEngine {
        GeometryEngine::new(Measure::Planar, None)
    }

    fn line(fid: u64, len: f64) -> Feature {
        Feature::new(
            fid,
            Some(Geometry::LineString(LineString::from(vec![(0.0, 0.0), (len, 0.0)]))),
        )
    }

    #[test]
    fn polylines_get_truncated_length() {
        let mut layer = SourceLayer::for_test(
            "Springfield",
            "roads",
            GeometryKind::Polyline,
            vec![line(1, 8.9), line(2, 450.2)],
        );

        let summary = annotate(&mut layer, &planar()).unwrap();
        assert_eq!(summary.features, 2);
        assert!(layer.annotated);
        assert_eq!(derived_value(&layer.features[0], LENGTH_FIELD), Some(8));
        assert_eq!(derived_value(&layer.features[1], LENGTH_FIELD), Some(450));
        assert_eq!(
            layer.schema.field(LENGTH_FIELD).unwrap().field_type,
            FieldType::Integer
        );
    }

    #[test]
    fn points_get_coordinates_and_new_number() {
        let mut layer = SourceLayer::for_test(
            "Springfield",
            "buildings",
            GeometryKind::Point,
            vec![
                Feature::new(1, Some(Geometry::Point(Point::new(100.7, -20.2)))),
                Feature::new(
                    2,
                    Some(Geometry::MultiPoint(MultiPoint::from(vec![(0.0, 0.0), (10.0, 4.0)]))),
                )
                .with(NEW_NUMBER_FIELD, "BL1#2"),
            ],
        );

        annotate(&mut layer, &planar()).unwrap();

        let first = &layer.features[0];
        assert_eq!(derived_value(first, POINT_X_FIELD), Some(100));
        assert_eq!(derived_value(first, POINT_Y_FIELD), Some(-20));
        assert!(first.get(NEW_NUMBER_FIELD).is_null());

        let second = &layer.features[1];
        assert_eq!(derived_value(second, POINT_X_FIELD), Some(5));
        assert_eq!(derived_value(second, POINT_Y_FIELD), Some(2));
        assert_eq!(second.get(NEW_NUMBER_FIELD), &FieldValue::from("BL1#2"));
        assert!(layer.schema.contains(NEW_NUMBER_FIELD));
    }

    #[test]
    fn polygons_get_area() {
        let square = polygon![
            (x: 0.0, y: 0.0),
            (x: 10.0, y: 0.0),
            (x: 10.0, y: 10.5),
            (x: 0.0, y: 10.5),
        ];
        let mut layer = SourceLayer::for_test(
            "Springfield",
            "blocks",
            GeometryKind::Polygon,
            vec![Feature::new(1, Some(Geometry::Polygon(square)))],
        );

        annotate(&mut layer, &planar()).unwrap();
        assert_eq!(derived_value(&layer.features[0], POLY_AREA_FIELD), Some(105));
    }

    #[test]
    fn annotation_is_idempotent() {
        let mut layer = SourceLayer::for_test(
            "Springfield",
            "roads",
            GeometryKind::Polyline,
            vec![line(1, 42.5)],
        );

        annotate(&mut layer, &planar()).unwrap();
        let once = layer.features.clone();
        let schema_once: LayerSchema = layer.schema.clone();
        annotate(&mut layer, &planar()).unwrap();

        assert_eq!(layer.features, once);
        assert_eq!(layer.schema, schema_once);
    }

    #[test]
    fn failure_leaves_features_untouched() {
        let mut layer = SourceLayer::for_test(
            "Springfield",
            "roads",
            GeometryKind::Polyline,
            vec![line(1, 20.0), Feature::new(2, None)],
        );

        let err = annotate(&mut layer, &planar()).unwrap_err();
        assert!(matches!(err, AnnotateError::MissingGeometry { fid: 2 }));
        assert!(!layer.annotated);
        assert!(layer.features[0].get(LENGTH_FIELD).is_null());
        assert!(layer.schema.contains(LENGTH_FIELD));
    }

    #[test]
    fn wrong_geometry_kind_is_a_measurement_error() {
        let mut layer = SourceLayer::for_test(
            "Springfield",
            "roads",
            GeometryKind::Polyline,
            vec![Feature::new(1, Some(Geometry::Point(Point::new(0.0, 0.0))))],
        );

        assert!(matches!(
            annotate(&mut layer, &planar()),
            Err(AnnotateError::Measurement { fid: 1, .. })
        ));
    }
}
