//! Computed availability set
//!
//! The sources that cover at least one requested `(entity, year, quarter)`.
//! This set, not the model, decides which sources may be queried.

use crate::catalog::Availability;
use crate::models::{BankEntity, Quarter};
use std::collections::{BTreeMap, BTreeSet};

/// Per-source list of the requested targets it covers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceCoverage(pub BTreeMap<String, Vec<(i64, i32, Quarter)>>);

impl SourceCoverage {
    pub fn compute(availability: &Availability, targets: &[(i64, i32, Quarter)]) -> Self {
        let mut coverage: BTreeMap<String, Vec<(i64, i32, Quarter)>> = BTreeMap::new();
        for target @ (entity_id, fiscal_year, quarter) in targets.iter().copied() {
            for source in availability.sources_covering(entity_id, fiscal_year, quarter) {
                coverage.entry(source).or_default().push(target);
            }
        }
        Self(coverage)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.0.contains_key(source_id)
    }

    pub fn source_ids(&self) -> BTreeSet<String> {
        self.0.keys().cloned().collect()
    }

    /// One line per source: description plus the targets it covers
    pub fn render(
        &self,
        descriptions: &BTreeMap<String, String>,
        banks: &BTreeMap<i64, BankEntity>,
    ) -> String {
        let mut out = String::new();
        for (source, targets) in &self.0 {
            let description = descriptions.get(source).map(String::as_str).unwrap_or("no description");
            let covered: Vec<String> = targets
                .iter()
                .map(|(entity_id, year, quarter)| format!("{} {} {}", bank_label(*entity_id, banks), year, quarter))
                .collect();
            out.push_str(&format!("- {}: {} (covers {})\n", source, description, covered.join(", ")));
        }
        out
    }
}

pub fn bank_label(entity_id: i64, banks: &BTreeMap<i64, BankEntity>) -> String {
    banks
        .get(&entity_id)
        .map(|b| b.symbol.clone())
        .unwrap_or_else(|| format!("bank {}", entity_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_over_targets() {
        let mut availability = Availability::default();
        availability.insert(1, "transcripts", 2024, Quarter::Q3);
        availability.insert(2, "reports", 2024, Quarter::Q3);
        availability.insert(2, "benchmarking", 2023, Quarter::Q4);

        let coverage = SourceCoverage::compute(
            &availability,
            &[(1, 2024, Quarter::Q3), (2, 2024, Quarter::Q3)],
        );

        assert_eq!(
            coverage.source_ids(),
            ["reports".to_string(), "transcripts".to_string()].into_iter().collect()
        );
        assert!(!coverage.contains("benchmarking"));
    }

    #[test]
    fn test_no_targets_is_empty() {
        let mut availability = Availability::default();
        availability.insert(1, "transcripts", 2024, Quarter::Q3);
        assert!(SourceCoverage::compute(&availability, &[]).is_empty());
        assert!(SourceCoverage::compute(&availability, &[(1, 2022, Quarter::Q1)]).is_empty());
    }

    #[test]
    fn test_render_lists_descriptions_and_targets() {
        let mut availability = Availability::default();
        availability.insert(1, "transcripts", 2024, Quarter::Q3);
        let coverage = SourceCoverage::compute(&availability, &[(1, 2024, Quarter::Q3)]);

        let descriptions: BTreeMap<String, String> =
            [("transcripts".to_string(), "Earnings calls".to_string())].into_iter().collect();
        let rendered = coverage.render(&descriptions, &BTreeMap::new());
        assert_eq!(rendered, "- transcripts: Earnings calls (covers bank 1 2024 Q3)\n");
    }
}
