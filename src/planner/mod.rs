//! Planner
//!
//! Picks the data sources to query. The model's selection is advisory: any
//! source outside the computed availability set is rejected.

use crate::completion::CompletionRequest;
use crate::context::RunContext;
use crate::conversation::ConversationState;
use crate::error::OrchestrationError;
use crate::models::{Combination, ExtractionResult, SourceSelection, Usage};
use crate::monitor::StageRecord;
use crate::prompts;
use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, warn};

pub mod availability;
pub use availability::SourceCoverage;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Success,
    NoData,
    Error,
}

#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub status: PlanStatus,
    pub selections: Vec<SourceSelection>,
    /// Computed availability set
    pub available_sources: BTreeSet<String>,
    pub reason: Option<String>,
    pub usage: Usage,
}

impl PlanOutcome {
    fn without_selections(status: PlanStatus, available_sources: BTreeSet<String>, reason: String) -> Self {
        Self {
            status,
            selections: Vec::new(),
            available_sources,
            reason: Some(reason),
            usage: Usage::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "snake_case")]
enum PlannerCall {
    SourcesSelected {
        #[serde(default)]
        selections: Vec<RawSelection>,
    },
    NoSourcesNeeded {
        #[serde(default)]
        reason: String,
    },
}

#[derive(Debug, Deserialize)]
struct RawSelection {
    #[serde(default)]
    source_id: String,
    #[serde(default)]
    query_intent: String,
}

/// Keep selections inside the computed set, first occurrence per source.
/// Returns the kept selections and the rejected source ids.
pub fn filter_selections(
    selections: Vec<SourceSelection>,
    available: &BTreeSet<String>,
    default_intent: &str,
) -> (Vec<SourceSelection>, Vec<String>) {
    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    let mut rejected = Vec::new();

    for selection in selections {
        let source_id = selection.source_id.trim().to_string();
        if !available.contains(&source_id) {
            rejected.push(source_id);
            continue;
        }
        if !seen.insert(source_id.clone()) {
            continue;
        }

        let query_intent = match selection.query_intent.trim() {
            "" => default_intent.to_string(),
            intent => intent.to_string(),
        };
        kept.push(SourceSelection { source_id, query_intent });
    }

    (kept, rejected)
}

/// Select sources for the extracted combinations. Never fails past this
/// boundary.
pub async fn plan(
    conversation: &ConversationState,
    extraction: &ExtractionResult,
    ctx: &RunContext,
) -> PlanOutcome {
    let started = Utc::now();

    let outcome = match plan_inner(conversation, extraction, ctx).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(run_id = %ctx.run_id, error = %e, "Planning failed");
            PlanOutcome::without_selections(PlanStatus::Error, BTreeSet::new(), e.to_string())
        }
    };

    info!(
        run_id = %ctx.run_id,
        status = ?outcome.status,
        available = outcome.available_sources.len(),
        selected = outcome.selections.len(),
        "Planner finished"
    );

    let mut record = StageRecord::new(prompts::PLANNER, started)
        .with_usage(outcome.usage)
        .with_details(json!({
            "status": outcome.status,
            "available_sources": outcome.available_sources,
            "selections": outcome.selections,
            "reason": outcome.reason,
        }));
    if outcome.status == PlanStatus::Error {
        record = record.with_error(outcome.reason.clone().unwrap_or_default());
    }
    ctx.ledger.record(record).await;

    outcome
}

async fn plan_inner(
    conversation: &ConversationState,
    extraction: &ExtractionResult,
    ctx: &RunContext,
) -> Result<PlanOutcome> {
    let targets = match &extraction.periods {
        Some(periods) => periods.targets(&extraction.entity_ids),
        None => Vec::new(),
    };

    let ids: Vec<i64> = extraction.entity_ids.iter().copied().collect();
    let availability = ctx.catalog().lookup(Some(ids.as_slice()), ctx.source_filter()).await?;
    let coverage = SourceCoverage::compute(&availability, &targets);
    let available_sources = coverage.source_ids();

    if coverage.is_empty() {
        info!(run_id = %ctx.run_id, targets = targets.len(), "No source covers the requested periods");
        return Ok(PlanOutcome::without_selections(
            PlanStatus::NoData,
            available_sources,
            "no data source covers the requested banks and periods".to_string(),
        ));
    }

    let descriptions = ctx.catalog().source_descriptions().await?;
    let prompt = ctx.prompts().get(prompts::PLANNER)?;

    let rendered_sources = coverage.render(&descriptions, &extraction.entity_detail);
    let banks = extraction
        .entity_detail
        .values()
        .map(|b| format!("{} ({})", b.name, b.symbol))
        .collect::<Vec<_>>()
        .join(", ");
    let periods = describe_combinations(&extraction.combinations, extraction);

    let vars = [
        ("intent", extraction.intent.as_str()),
        ("banks", banks.as_str()),
        ("periods", periods.as_str()),
        ("available_sources", rendered_sources.as_str()),
    ];

    let request = CompletionRequest::new(prompts::PLANNER, prompt.with_conversation(&vars, conversation))
        .with_required_tools(prompt.tools.clone())
        .with_temperature(0.0);

    debug!(run_id = %ctx.run_id, sources = ?available_sources, "Asking model to select sources");

    let completion = ctx.completion().invoke(&request).await?;
    let usage = completion.usage;

    let call = completion
        .tool_calls
        .iter()
        .find_map(|call| call.parse::<PlannerCall>().ok())
        .ok_or_else(|| OrchestrationError::LlmError("planner returned no recognised tool call".to_string()))?;

    let outcome = match call {
        PlannerCall::NoSourcesNeeded { reason } => PlanOutcome {
            usage,
            ..PlanOutcome::without_selections(PlanStatus::NoData, available_sources, reason)
        },
        PlannerCall::SourcesSelected { selections } => {
            let selections = selections
                .into_iter()
                .map(|raw| SourceSelection {
                    source_id: raw.source_id,
                    query_intent: raw.query_intent,
                })
                .collect();

            let (kept, rejected) = filter_selections(selections, &available_sources, &extraction.intent);
            if !rejected.is_empty() {
                warn!(run_id = %ctx.run_id, ?rejected, "Rejecting sources outside the computed availability set");
            }

            if kept.is_empty() {
                PlanOutcome {
                    usage,
                    ..PlanOutcome::without_selections(
                        PlanStatus::NoData,
                        available_sources,
                        "no selected source is available".to_string(),
                    )
                }
            } else {
                PlanOutcome {
                    status: PlanStatus::Success,
                    selections: kept,
                    available_sources,
                    reason: None,
                    usage,
                }
            }
        }
    };

    Ok(outcome)
}

fn describe_combinations(combinations: &[Combination], extraction: &ExtractionResult) -> String {
    combinations
        .iter()
        .map(|c| {
            format!(
                "{} FY{} {}",
                availability::bank_label(c.entity_id, &extraction.entity_detail),
                c.fiscal_year,
                c.quarter
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}
