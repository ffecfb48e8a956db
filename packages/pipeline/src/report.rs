//! Final tally of a consolidation run.

use std::path::PathBuf;

use serde::Serialize;

use crate::Issue;

/// What a run did, plus every recoverable problem it met.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    /// Destination dataset directory.
    pub dataset: PathBuf,
    /// Distinct cities that contributed at least one layer.
    pub cities: u64,
    /// Source layers loaded.
    pub source_layers: u64,
    /// Source layers whose derived fields were computed.
    pub annotated_layers: u64,
    /// Destination layers created.
    pub destinations_created: u64,
    /// Source layers appended to their destination.
    pub layers_merged: u64,
    /// Features written by the merge.
    pub features_admitted: u64,
    /// Features dropped by admission predicates.
    pub features_rejected: u64,
    /// Building/block layer pairs linked.
    pub pairs: u64,
    /// Distinct block numbers processed.
    pub blocks_processed: u64,
    /// Buildings that received an identifier.
    pub buildings_linked: u64,
    /// Identifier writes replaced by a later block.
    pub buildings_overwritten: u64,
    /// Recoverable failures, in the order they occurred.
    pub issues: Vec<Issue>,
    /// Wall-clock run time.
    pub elapsed_secs: f64,
}

impl RunReport {
    /// Whether the run met no recoverable failure.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    /// Logs the tally at `info`, and each issue kind count at `warn`.
    pub fn log_summary(&self) {
        log::info!(
            "Consolidation complete: {} source layer(s) from {} cities merged into {} destination(s) in {:.1}s",
            self.source_layers,
            self.cities,
            self.destinations_created,
            self.elapsed_secs
        );
        log::info!(
            "  features: {} admitted, {} rejected; annotated layers: {}",
            self.features_admitted,
            self.features_rejected,
            self.annotated_layers
        );
        log::info!(
            "  linkage: {} pair(s), {} block(s), {} building(s) linked ({} overwritten)",
            self.pairs,
            self.blocks_processed,
            self.buildings_linked,
            self.buildings_overwritten
        );

        if self.issues.is_empty() {
            return;
        }
        log::warn!("{} issue(s) during the run:", self.issues.len());
        for issue in &self.issues {
            log::warn!("  {issue}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_issues_with_their_kind() {
        let report = RunReport {
            cities: 2,
            issues: vec![Issue::Pairing {
                city: "North".to_string(),
                reason: "no blocks layer".to_string(),
            }],
            ..RunReport::default()
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["cities"], 2);
        assert_eq!(json["issues"][0]["kind"], "pairing");
        assert_eq!(json["issues"][0]["city"], "North");
        assert!(!report.is_clean());
    }
}
