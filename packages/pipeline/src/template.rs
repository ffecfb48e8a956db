//! Destination layer creation.
//!
//! One empty layer is created per distinct canonical name, using the source
//! layer's schema (derived fields included) and spatial reference as the
//! template.

use muni_merge_layer_models::{CanonicalName, GeometryKind};
use muni_merge_store::Dataset;

use crate::catalog::SourceLayer;
use crate::{Issue, record};

/// A destination layer created in the dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationLayer {
    /// Canonical name, also the stored layer name.
    pub name: CanonicalName,
    /// Geometry family.
    pub kind: GeometryKind,
}

/// Destinations created (or reused) plus template failures.
#[derive(Debug, Default)]
pub struct TemplateOutcome {
    /// Destination layers in creation order.
    pub destinations: Vec<DestinationLayer>,
    /// Layers that could not be created.
    pub issues: Vec<Issue>,
}

/// Creates an empty destination layer for every source layer.
///
/// Two source layers sharing a canonical name and kind share one
/// destination. Fields the first template lacked are added to it, and a
/// field typed differently is widened (integer to real, anything to text)
/// so every source value still fits. A name already taken by a layer of
/// another kind is an [`Issue::SchemaCreation`].
pub fn create_destinations(dataset: &mut Dataset, sources: &[SourceLayer]) -> TemplateOutcome {
    let mut outcome = TemplateOutcome::default();

    for source in sources {
        let name = source.name.to_string();

        if let Some(existing) = dataset.layer_mut(&name) {
            if existing.kind() == source.kind {
                let mut changed = 0;
                for field in source.schema.fields() {
                    if existing.widen_field(field.clone()) {
                        changed += 1;
                    }
                }
                log::debug!(
                    "Reusing destination {name} for {} ({changed} field(s) added or widened)",
                    source.path.display()
                );
            } else {
                let reason = format!(
                    "destination already exists as a {} layer, source is {}",
                    existing.kind(),
                    source.kind
                );
                record(
                    &mut outcome.issues,
                    Issue::SchemaCreation { layer: name, reason },
                );
            }
            continue;
        }

        let spatial_ref = source.spatial_ref.clone();
        match dataset.create_layer(&name, source.kind, &source.schema, spatial_ref) {
            Ok(_) => outcome.destinations.push(DestinationLayer {
                name: source.name.clone(),
                kind: source.kind,
            }),
            Err(e) => record(
                &mut outcome.issues,
                Issue::SchemaCreation {
                    layer: name,
                    reason: e.to_string(),
                },
            ),
        }
    }

    log::info!("Created {} destination layer(s)", outcome.destinations.len());
    outcome
}
