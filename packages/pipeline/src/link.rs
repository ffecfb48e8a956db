//! Building to block spatial linkage.
//!
//! For each block number of a city, the block polygons carrying it are
//! selected and spatially joined with the city's buildings. The join is
//! materialized as a scratch layer, then every building it returns gets
//! `new_number = "BL{block}#{building}"`.
//!
//! Blocks are processed in first-appearance order and each write replaces
//! the previous one, so a building intersecting several blocks ends up
//! referencing the last of them.

use std::collections::BTreeSet;

use geo::Geometry;
use muni_merge_layer_models::{
    BuildingBlockLink, Feature, FieldDef, FieldType, FieldValue, GeometryKind, LayerSchema,
    NEW_NUMBER_FIELD,
};
use muni_merge_spatial::IntersectionIndex;
use muni_merge_store::{Dataset, Layer, MemoryWorkspace, StoreError};

use crate::config::FieldNames;
use crate::pair::LayerPair;
use crate::{Issue, record};

/// Building id column of the join layer.
const JOIN_BUILDING_FIELD: &str = "building_id";

/// Block number column of the join layer.
const JOIN_BLOCK_FIELD: &str = "block_number";

/// Totals of one city's linkage.
#[derive(Debug, Default)]
pub struct LinkOutcome {
    /// Distinct block numbers processed.
    pub blocks_processed: u64,
    /// Distinct buildings that received an identifier.
    pub buildings_linked: u64,
    /// Identifier writes that replaced one from an earlier block.
    pub buildings_overwritten: u64,
    /// Linkage failures.
    pub issues: Vec<Issue>,
}

/// Links the buildings of `pair` to its blocks.
///
/// Failures of a single block are reported and the next block is
/// processed. A layer or field missing for the whole city is reported once.
pub fn link(
    dataset: &mut Dataset,
    workspace: &mut MemoryWorkspace,
    pair: &LayerPair,
    fields: &FieldNames,
) -> LinkOutcome {
    let mut outcome = LinkOutcome::default();

    let prepared = match prepare(dataset, pair, fields) {
        Ok(prepared) => prepared,
        Err(e) => {
            record(
                &mut outcome.issues,
                Issue::Linkage {
                    city: pair.city.clone(),
                    block: None,
                    reason: e.to_string(),
                },
            );
            return outcome;
        }
    };

    let mut linked: BTreeSet<u64> = BTreeSet::new();
    for block in &prepared.block_numbers {
        match link_block(dataset, workspace, pair, fields, &prepared, block) {
            Ok(updated) => {
                outcome.blocks_processed += 1;
                for fid in updated {
                    if !linked.insert(fid) {
                        log::debug!(
                            "{}: building {fid} re-linked to block {block}",
                            pair.city
                        );
                        outcome.buildings_overwritten += 1;
                    }
                }
            }
            Err(e) => record(
                &mut outcome.issues,
                Issue::Linkage {
                    city: pair.city.clone(),
                    block: Some(block.to_string()),
                    reason: e.to_string(),
                },
            ),
        }
    }
    outcome.buildings_linked = linked.len() as u64;

    log::info!(
        "{}: linked {} building(s) across {} block(s)",
        pair.city,
        outcome.buildings_linked,
        outcome.blocks_processed
    );
    outcome
}

/// Per-city state shared by every block iteration.
struct Prepared {
    block_numbers: Vec<FieldValue>,
    buildings: IntersectionIndex<u64>,
    join_schema: LayerSchema,
    spatial_ref: Option<serde_json::Value>,
}

fn prepare(
    dataset: &Dataset,
    pair: &LayerPair,
    fields: &FieldNames,
) -> Result<Prepared, StoreError> {
    let blocks = dataset.require(&pair.blocks)?;
    let buildings = dataset.require(&pair.buildings)?;

    let block_type = field_type(blocks, &fields.block_number)?;
    let building_type = field_type(buildings, &fields.building_number)?;
    field_type(buildings, NEW_NUMBER_FIELD)?;

    let mut block_numbers: Vec<FieldValue> = Vec::new();
    for row in blocks.read(&[fields.block_number.as_str()])? {
        let Some(value) = row.values.into_iter().next() else {
            continue;
        };
        if !value.is_null() && !block_numbers.iter().any(|seen| seen.equals(&value)) {
            block_numbers.push(value);
        }
    }

    let index = IntersectionIndex::build(
        buildings
            .features()
            .iter()
            .filter_map(|f| f.geometry.clone().map(|g| (f.fid, g))),
    );

    Ok(Prepared {
        block_numbers,
        buildings: index,
        join_schema: LayerSchema::new([
            FieldDef::new(JOIN_BUILDING_FIELD, building_type),
            FieldDef::new(NEW_NUMBER_FIELD, FieldType::Text),
            FieldDef::new(JOIN_BLOCK_FIELD, block_type),
        ]),
        spatial_ref: buildings.spatial_ref().cloned(),
    })
}

fn field_type(layer: &Layer, field: &str) -> Result<FieldType, StoreError> {
    layer
        .schema()
        .field(field)
        .map(|def| def.field_type)
        .ok_or_else(|| StoreError::FieldNotFound {
            layer: layer.name().to_string(),
            field: field.to_string(),
        })
}

/// Processes one block number, returning the ids of the buildings updated.
fn link_block(
    dataset: &mut Dataset,
    workspace: &mut MemoryWorkspace,
    pair: &LayerPair,
    fields: &FieldNames,
    prepared: &Prepared,
    block: &FieldValue,
) -> Result<Vec<u64>, StoreError> {
    let selection = dataset.select_by_attribute(&pair.blocks, &fields.block_number, block)?;

    let joined = {
        let blocks = dataset.require(&pair.blocks)?;
        let buildings = dataset.require(&pair.buildings)?;
        let polygons: Vec<&Geometry<f64>> = blocks
            .selected(&selection)
            .filter_map(|f| f.geometry.as_ref())
            .collect();
        spatial_join(buildings, &prepared.buildings, &polygons, fields, block)
    };
    drop(selection);

    let mut scratch = workspace.scratch(Layer::new(
        format!("sj_{}_block{block}", pair.city),
        GeometryKind::Point,
        prepared.join_schema.clone(),
        prepared.spatial_ref.clone(),
    ))?;
    scratch.layer_mut().append(&joined, |_| true)?;

    let mut building_ids: Vec<FieldValue> = Vec::new();
    for row in scratch.layer().read(&[JOIN_BUILDING_FIELD, JOIN_BLOCK_FIELD])? {
        let mut values = row.values.into_iter();
        let (Some(id), Some(number)) = (values.next(), values.next()) else {
            continue;
        };
        let seen = building_ids.iter().any(|known| known.equals(&id));
        if number.equals(block) && !id.is_null() && !seen {
            building_ids.push(id);
        }
    }

    let mut updated = Vec::new();
    for id in building_ids {
        let identifier = BuildingBlockLink::new(block.clone(), id.clone()).identifier();
        let targets =
            dataset.select_by_attribute(&pair.buildings, &fields.building_number, &id)?;
        for &fid in targets.fids() {
            let value = FieldValue::from(identifier.as_str());
            dataset.update_field(&pair.buildings, fid, NEW_NUMBER_FIELD, value)?;
            updated.push(fid);
        }
    }

    log::trace!(
        "{}: block {block} matched {} building(s) via {}",
        pair.city,
        updated.len(),
        scratch.layer().name()
    );
    Ok(updated)
}

/// Join rows `(building_id, new_number, block_number)` for every building
/// intersecting one of `polygons`.
fn spatial_join(
    buildings: &Layer,
    index: &IntersectionIndex<u64>,
    polygons: &[&Geometry<f64>],
    fields: &FieldNames,
    block: &FieldValue,
) -> Vec<Feature> {
    let mut rows = Vec::new();
    for polygon in polygons {
        for fid in index.intersecting(polygon) {
            let Some(building) = buildings.feature(fid) else {
                continue;
            };
            rows.push(
                Feature::new(fid, building.geometry.clone())
                    .with(JOIN_BUILDING_FIELD, building.get(&fields.building_number).clone())
                    .with(NEW_NUMBER_FIELD, building.get(NEW_NUMBER_FIELD).clone())
                    .with(JOIN_BLOCK_FIELD, block.clone()),
            );
        }
    }
    rows
}
