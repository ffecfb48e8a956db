//! Building/block layer pairing.
//!
//! Destination layers are indexed by the city part of their canonical name,
//! so a city only ever pairs with its own layers: `North` and `North_East`
//! are different keys. A city is paired only when its non-polyline layers
//! are exactly one buildings layer and one blocks layer.

use muni_merge_layer_models::GeometryKind;

use crate::config::PairingKeywords;
use crate::template::DestinationLayer;
use crate::{Issue, record};

/// The building and block layers of one city.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerPair {
    /// City name.
    pub city: String,
    /// Building (point) layer name.
    pub buildings: String,
    /// Block (polygon) layer name.
    pub blocks: String,
}

/// Pairs found plus the cities that could not be paired.
#[derive(Debug, Default)]
pub struct PairingOutcome {
    /// One pair per fully equipped city, in first-appearance order.
    pub pairs: Vec<LayerPair>,
    /// Pairing failures.
    pub issues: Vec<Issue>,
}

#[derive(Debug, Default)]
struct CityLayers {
    buildings: Vec<String>,
    blocks: Vec<String>,
    unrecognized: Vec<String>,
}

/// Pairs each city's building layer with its block layer.
///
/// Polyline layers take no part. A layer is a building layer when its base
/// name contains the buildings keyword, otherwise a block layer when it
/// contains the blocks keyword (both case-insensitive). A city holding a
/// layer that is neither, a missing kind, or two layers of one kind is
/// reported as an [`Issue::Pairing`] and skipped.
pub fn pair_layers(layers: &[DestinationLayer], keywords: &PairingKeywords) -> PairingOutcome {
    let buildings_kw = keywords.buildings.to_lowercase();
    let blocks_kw = keywords.blocks.to_lowercase();

    let mut index: Vec<(String, CityLayers)> = Vec::new();
    for layer in layers.iter().filter(|l| l.kind != GeometryKind::Polyline) {
        let city = layer.name.city();
        let position = match index.iter().position(|(c, _)| c == city) {
            Some(position) => position,
            None => {
                index.push((city.to_string(), CityLayers::default()));
                index.len() - 1
            }
        };
        let entry = &mut index[position].1;

        let base = layer.name.base().to_lowercase();
        let name = layer.name.to_string();
        if base.contains(&buildings_kw) {
            entry.buildings.push(name);
        } else if base.contains(&blocks_kw) {
            entry.blocks.push(name);
        } else {
            entry.unrecognized.push(name);
        }
    }

    let mut outcome = PairingOutcome::default();
    for (city, entry) in index {
        if !entry.unrecognized.is_empty() {
            let reason = format!(
                "unrecognized layer kind: {} (neither {buildings_kw} nor {blocks_kw})",
                entry.unrecognized.join(", ")
            );
            record(&mut outcome.issues, Issue::Pairing { city, reason });
            continue;
        }

        let reason = match (entry.buildings.as_slice(), entry.blocks.as_slice()) {
            ([], []) => continue,
            ([buildings], [blocks]) => {
                log::debug!("Paired {buildings} with {blocks}");
                outcome.pairs.push(LayerPair {
                    city,
                    buildings: buildings.clone(),
                    blocks: blocks.clone(),
                });
                continue;
            }
            (_, []) => "no blocks layer".to_string(),
            ([], _) => "no buildings layer".to_string(),
            (buildings, blocks) => format!(
                "ambiguous: {} buildings and {} blocks layers",
                buildings.len(),
                blocks.len()
            ),
        };
        record(&mut outcome.issues, Issue::Pairing { city, reason });
    }

    log::info!("Paired {} city layer set(s)", outcome.pairs.len());
    outcome
}
