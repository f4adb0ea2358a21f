//! Availability catalog
//!
//! Ground truth for which bank / source / fiscal year / quarter combinations
//! have data. Every model answer about entities, periods or sources is
//! checked against it.

use crate::error::OrchestrationError;
use crate::models::{BankEntity, Quarter};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

/// entity_id → source_id → fiscal_year → quarters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Availability(pub BTreeMap<i64, BTreeMap<String, BTreeMap<i32, BTreeSet<Quarter>>>>);

impl Availability {
    pub fn insert(&mut self, entity_id: i64, source_id: &str, fiscal_year: i32, quarter: Quarter) {
        self.0
            .entry(entity_id)
            .or_default()
            .entry(source_id.to_string())
            .or_default()
            .entry(fiscal_year)
            .or_default()
            .insert(quarter);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn covers(&self, entity_id: i64, source_id: &str, fiscal_year: i32, quarter: Quarter) -> bool {
        self.0
            .get(&entity_id)
            .and_then(|sources| sources.get(source_id))
            .and_then(|years| years.get(&fiscal_year))
            .map(|quarters| quarters.contains(&quarter))
            .unwrap_or(false)
    }

    /// Sources that hold data for one entity-period
    pub fn sources_covering(&self, entity_id: i64, fiscal_year: i32, quarter: Quarter) -> BTreeSet<String> {
        self.0
            .get(&entity_id)
            .map(|sources| {
                sources
                    .iter()
                    .filter(|(_, years)| {
                        years
                            .get(&fiscal_year)
                            .map(|q| q.contains(&quarter))
                            .unwrap_or(false)
                    })
                    .map(|(source, _)| source.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_period(&self, entity_id: i64, fiscal_year: i32, quarter: Quarter) -> bool {
        !self.sources_covering(entity_id, fiscal_year, quarter).is_empty()
    }

    /// True when any entity has this period in any source
    pub fn any_has_period(&self, fiscal_year: i32, quarter: Quarter) -> bool {
        self.0
            .keys()
            .any(|entity_id| self.has_period(*entity_id, fiscal_year, quarter))
    }

    /// Markdown table of the availability, one row per entity/source/year
    pub fn render_table(&self, banks: &BTreeMap<i64, BankEntity>) -> String {
        if self.0.is_empty() {
            return "No data is available for the requested banks.".to_string();
        }

        let mut out = String::from("| bank_id | bank | source | fiscal_year | quarters |\n");
        out.push_str("|---|---|---|---|---|\n");

        for (entity_id, sources) in &self.0 {
            let name = banks
                .get(entity_id)
                .map(|b| format!("{} ({})", b.name, b.symbol))
                .unwrap_or_else(|| "—".to_string());

            for (source, years) in sources {
                for (year, quarters) in years.iter().rev() {
                    let quarters: Vec<String> = quarters.iter().map(|q| q.to_string()).collect();
                    out.push_str(&format!(
                        "| {} | {} | {} | {} | {} |\n",
                        entity_id,
                        name,
                        source,
                        year,
                        quarters.join(", ")
                    ));
                }
            }
        }

        out
    }
}

/// Read access to banks and their data coverage
#[async_trait]
pub trait AvailabilityCatalog: Send + Sync {
    /// Banks index, optionally limited to banks covered by `source_ids`
    async fn banks(&self, source_ids: Option<&[String]>) -> Result<BTreeMap<i64, BankEntity>>;

    /// Coverage, optionally limited to entities and/or sources
    async fn lookup(
        &self,
        entity_ids: Option<&[i64]>,
        source_ids: Option<&[String]>,
    ) -> Result<Availability>;

    /// Static description of each data source
    async fn source_descriptions(&self) -> Result<BTreeMap<String, String>>;
}

/// Render the banks index as prompt text
pub fn render_bank_index(banks: &BTreeMap<i64, BankEntity>) -> String {
    let mut out = String::new();
    for bank in banks.values() {
        out.push_str(&format!("- id {}: {} ({})", bank.id, bank.name, bank.symbol));
        if !bank.aliases.is_empty() {
            let aliases: Vec<&str> = bank.aliases.iter().map(String::as_str).collect();
            out.push_str(&format!("; aliases: {}", aliases.join(", ")));
        }
        if !bank.tags.is_empty() {
            let tags: Vec<&str> = bank.tags.iter().map(String::as_str).collect();
            out.push_str(&format!("; tags: {}", tags.join(", ")));
        }
        out.push('\n');
    }
    out
}

//
// ================= In-memory catalog =================
//

#[derive(Debug, Deserialize)]
struct CatalogFile {
    banks: Vec<BankEntity>,
    #[serde(default)]
    availability: Vec<AvailabilityRow>,
    #[serde(default)]
    sources: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct AvailabilityRow {
    entity_id: i64,
    source_id: String,
    fiscal_year: i32,
    quarters: Vec<Quarter>,
}

/// Catalog held in memory, built in code or loaded from JSON
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    banks: BTreeMap<i64, BankEntity>,
    availability: Availability,
    sources: BTreeMap<String, String>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bank(mut self, bank: BankEntity) -> Self {
        self.banks.insert(bank.id, bank);
        self
    }

    pub fn with_source(mut self, source_id: &str, description: &str) -> Self {
        self.sources
            .insert(source_id.to_string(), description.to_string());
        self
    }

    /// Record coverage and keep the bank's `sources` set in step
    pub fn with_coverage(
        mut self,
        entity_id: i64,
        source_id: &str,
        fiscal_year: i32,
        quarters: &[Quarter],
    ) -> Self {
        for quarter in quarters {
            self.availability
                .insert(entity_id, source_id, fiscal_year, *quarter);
        }
        if let Some(bank) = self.banks.get_mut(&entity_id) {
            bank.sources.insert(source_id.to_string());
        }
        self
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(raw)?;

        let mut catalog = Self::new();
        for bank in file.banks {
            catalog = catalog.with_bank(bank);
        }
        for row in file.availability {
            if !catalog.banks.contains_key(&row.entity_id) {
                return Err(OrchestrationError::CatalogError(format!(
                    "availability row references unknown bank {}",
                    row.entity_id
                )));
            }
            catalog = catalog.with_coverage(row.entity_id, &row.source_id, row.fiscal_year, &row.quarters);
        }
        for (source, description) in file.sources {
            catalog = catalog.with_source(&source, &description);
        }

        Ok(catalog)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OrchestrationError::CatalogError(format!(
                "failed to read catalog {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn into_shared(self) -> Arc<dyn AvailabilityCatalog> {
        Arc::new(self)
    }
}

#[async_trait]
impl AvailabilityCatalog for InMemoryCatalog {
    async fn banks(&self, source_ids: Option<&[String]>) -> Result<BTreeMap<i64, BankEntity>> {
        Ok(self
            .banks
            .iter()
            .filter(|(_, bank)| match source_ids {
                Some(filter) => filter.iter().any(|s| bank.sources.contains(s)),
                None => true,
            })
            .map(|(id, bank)| (*id, bank.clone()))
            .collect())
    }

    async fn lookup(
        &self,
        entity_ids: Option<&[i64]>,
        source_ids: Option<&[String]>,
    ) -> Result<Availability> {
        let mut out = Availability::default();

        for (entity_id, sources) in &self.availability.0 {
            if let Some(ids) = entity_ids {
                if !ids.contains(entity_id) {
                    continue;
                }
            }

            for (source, years) in sources {
                if let Some(filter) = source_ids {
                    if !filter.iter().any(|s| s == source) {
                        continue;
                    }
                }

                for (year, quarters) in years {
                    for quarter in quarters {
                        out.insert(*entity_id, source, *year, *quarter);
                    }
                }
            }
        }

        Ok(out)
    }

    async fn source_descriptions(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.sources.clone())
    }
}
