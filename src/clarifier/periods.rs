//! Period phase: which fiscal years and quarters
//!
//! With banks known the model picks periods from the availability table.
//! Without banks it only judges whether the period phrasing is clear.

use super::retry::{run_bounded, AttemptOutcome, RetryOutcome};
use super::UsageMeter;
use crate::catalog::Availability;
use crate::completion::args::{lenient_bool, lenient_i32, lenient_i64, lenient_quarters};
use crate::completion::{Completion, CompletionRequest};
use crate::context::RunContext;
use crate::conversation::ConversationState;
use crate::models::{BankEntity, EntityPeriods, ExtractionStatus, PeriodSpec, Quarter};
use crate::monitor::StageRecord;
use crate::prompts;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

pub const FALLBACK_PERIOD_QUESTION: &str = "Which fiscal year and quarter(s) are you interested in?";

#[derive(Debug, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "snake_case")]
enum PeriodCall {
    PeriodsAll {
        #[serde(deserialize_with = "lenient_i32")]
        fiscal_year: i32,
        #[serde(default, deserialize_with = "lenient_quarters")]
        quarters: BTreeSet<Quarter>,
    },
    PeriodsSpecific {
        #[serde(default)]
        periods: Vec<RawEntityPeriods>,
    },
    PeriodClarification {
        #[serde(default)]
        question: String,
    },
    PeriodsValid {
        #[serde(deserialize_with = "lenient_bool")]
        periods_clear: bool,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct RawEntityPeriods {
    #[serde(deserialize_with = "lenient_i64")]
    entity_id: i64,
    #[serde(deserialize_with = "lenient_i32")]
    fiscal_year: i32,
    #[serde(default, deserialize_with = "lenient_quarters")]
    quarters: BTreeSet<Quarter>,
}

impl From<RawEntityPeriods> for EntityPeriods {
    fn from(raw: RawEntityPeriods) -> Self {
        Self {
            entity_id: raw.entity_id,
            fiscal_year: raw.fiscal_year,
            quarters: raw.quarters,
        }
    }
}

#[derive(Debug)]
enum PeriodVerdict {
    Periods(PeriodSpec),
    /// Validity mode: the phrasing is clear, nothing to extract yet
    Clear,
    Clarify(String),
}

#[derive(Debug, Clone)]
pub struct PeriodExtraction {
    pub status: ExtractionStatus,
    pub periods: Option<PeriodSpec>,
    pub clarification: Option<String>,
    /// Coverage the model was shown; reused for combination expansion
    pub availability: Availability,
    pub error: Option<String>,
    pub attempts: u32,
}

impl PeriodExtraction {
    fn failed(error: String) -> Self {
        Self {
            status: ExtractionStatus::Error,
            periods: None,
            clarification: None,
            availability: Availability::default(),
            error: Some(error),
            attempts: 0,
        }
    }
}

/// Merge per-entity records on the `(entity_id, fiscal_year)` key so that
/// repeated records accumulate quarters.
pub fn merge_entity_periods(records: impl IntoIterator<Item = EntityPeriods>) -> Vec<EntityPeriods> {
    let mut merged: BTreeMap<(i64, i32), BTreeSet<Quarter>> = BTreeMap::new();
    for record in records {
        merged
            .entry((record.entity_id, record.fiscal_year))
            .or_default()
            .extend(record.quarters);
    }

    merged
        .into_iter()
        .map(|((entity_id, fiscal_year), quarters)| EntityPeriods {
            entity_id,
            fiscal_year,
            quarters,
        })
        .collect()
}

/// Extract periods for `entity_ids`. An empty set switches to the reduced
/// validity check. Never fails past this boundary.
pub async fn extract_periods(
    conversation: &ConversationState,
    entity_ids: &BTreeSet<i64>,
    entity_detail: &BTreeMap<i64, BankEntity>,
    intent: &str,
    ctx: &RunContext,
) -> PeriodExtraction {
    let started = Utc::now();
    let validity_mode = entity_ids.is_empty();
    let stage = if validity_mode {
        prompts::CLARIFIER_PERIOD_VALIDITY
    } else {
        prompts::CLARIFIER_PERIODS
    };

    let ids: Vec<i64> = entity_ids.iter().copied().collect();
    let lookup = ctx
        .catalog()
        .lookup((!validity_mode).then_some(ids.as_slice()), ctx.source_filter())
        .await;

    let availability = match lookup {
        Ok(availability) => availability,
        Err(e) => {
            warn!(run_id = %ctx.run_id, error = %e, "Availability lookup failed");
            ctx.ledger
                .record(StageRecord::new(stage, started).with_error(e.to_string()))
                .await;
            return PeriodExtraction::failed(e.to_string());
        }
    };

    let prompt = match ctx.prompts().get(stage) {
        Ok(prompt) => prompt,
        Err(e) => {
            ctx.ledger
                .record(StageRecord::new(stage, started).with_error(e.to_string()))
                .await;
            return PeriodExtraction::failed(e.to_string());
        }
    };

    let table = availability.render_table(entity_detail);
    let banks = describe_banks(entity_detail);
    let current_date = Utc::now().format("%Y-%m-%d").to_string();
    let vars = [
        ("banks", banks.as_str()),
        ("intent", intent),
        ("availability_table", table.as_str()),
        ("current_date", current_date.as_str()),
    ];

    let request = CompletionRequest::new(stage, prompt.with_conversation(&vars, conversation))
        .with_required_tools(prompt.tools.clone())
        .with_temperature(0.0);

    debug!(run_id = %ctx.run_id, validity_mode, entities = entity_ids.len(), "Extracting periods");

    let meter = UsageMeter::default();
    let (request, availability_ref, meter_ref) = (&request, &availability, &meter);
    let outcome = run_bounded(ctx.max_extraction_attempts, stage, move |_| async move {
        match ctx.completion().invoke(request).await {
            Ok(completion) => {
                meter_ref.add(completion.usage);
                if validity_mode {
                    interpret_validity(&completion)
                } else {
                    interpret_periods(&completion, entity_ids, availability_ref)
                }
            }
            Err(e) => AttemptOutcome::Reject(format!("completion failed: {}", e)),
        }
    })
    .await;

    let attempts = outcome.attempts();
    let (status, periods, clarification) = match outcome {
        RetryOutcome::Succeeded { value, .. } => match value {
            PeriodVerdict::Periods(spec) => (ExtractionStatus::Success, Some(spec), None),
            PeriodVerdict::Clear => (ExtractionStatus::Success, None, None),
            PeriodVerdict::Clarify(question) => (ExtractionStatus::NeedsClarification, None, Some(question)),
        },
        RetryOutcome::Exhausted { failures, .. } => {
            warn!(run_id = %ctx.run_id, attempts, "Period extraction exhausted, asking fallback question");
            debug!(?failures, "Period extraction failures");
            (
                ExtractionStatus::NeedsClarification,
                None,
                Some(FALLBACK_PERIOD_QUESTION.to_string()),
            )
        }
    };

    info!(run_id = %ctx.run_id, ?status, attempts, validity_mode, "Period extraction finished");

    ctx.ledger
        .record(
            StageRecord::new(stage, started)
                .with_usage(meter.total())
                .with_details(json!({
                    "status": status,
                    "periods": periods,
                    "clarification": clarification,
                    "attempts": attempts,
                })),
        )
        .await;

    PeriodExtraction {
        status,
        periods,
        clarification,
        availability,
        error: None,
        attempts,
    }
}

fn describe_banks(entity_detail: &BTreeMap<i64, BankEntity>) -> String {
    entity_detail
        .values()
        .map(|b| format!("{} ({}, id {})", b.name, b.symbol, b.id))
        .collect::<Vec<_>>()
        .join(", ")
}

fn recognised_calls(completion: &Completion) -> Vec<PeriodCall> {
    completion
        .tool_calls
        .iter()
        .filter_map(|call| match call.parse::<PeriodCall>() {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                debug!(error = %e, "Skipping unrecognised tool call");
                None
            }
        })
        .collect()
}

fn clarification_from(question: &str) -> AttemptOutcome<PeriodVerdict> {
    let question = question.trim();
    if question.is_empty() {
        AttemptOutcome::Reject("period_clarification without a question".to_string())
    } else {
        AttemptOutcome::Accept(PeriodVerdict::Clarify(question.to_string()))
    }
}

fn interpret_periods(
    completion: &Completion,
    entity_ids: &BTreeSet<i64>,
    availability: &Availability,
) -> AttemptOutcome<PeriodVerdict> {
    let calls = recognised_calls(completion);

    match calls.first() {
        None => AttemptOutcome::Reject("no recognised tool call".to_string()),
        Some(PeriodCall::PeriodClarification { question }) => clarification_from(question),
        Some(PeriodCall::PeriodsValid { .. }) => {
            AttemptOutcome::Reject("periods_valid is not accepted once banks are known".to_string())
        }
        Some(PeriodCall::PeriodsAll { .. }) => {
            let mut requested: BTreeMap<i32, BTreeSet<Quarter>> = BTreeMap::new();
            for call in &calls {
                if let PeriodCall::PeriodsAll { fiscal_year, quarters } = call {
                    requested.entry(*fiscal_year).or_default().extend(quarters.iter().copied());
                }
            }

            if requested.len() > 1 {
                // One ApplyAll holds a single year, so several years become per-entity records
                info!(years = ?requested.keys().collect::<Vec<_>>(), "Expanding periods_all across fiscal years");
                let records = requested.iter().flat_map(|(fiscal_year, quarters)| {
                    entity_ids.iter().map(move |entity_id| EntityPeriods {
                        entity_id: *entity_id,
                        fiscal_year: *fiscal_year,
                        quarters: quarters.clone(),
                    })
                });
                return entity_specific(records, entity_ids, availability);
            }

            let Some((fiscal_year, requested)) = requested.into_iter().next() else {
                return AttemptOutcome::Reject("no recognised tool call".to_string());
            };

            let (quarters, unavailable): (BTreeSet<Quarter>, BTreeSet<Quarter>) = requested
                .into_iter()
                .partition(|q| availability.any_has_period(fiscal_year, *q));

            if !unavailable.is_empty() {
                warn!(fiscal_year, dropped = ?unavailable, "Dropping quarters with no data");
            }
            if quarters.is_empty() {
                return AttemptOutcome::Reject(format!("no available quarters for FY{}", fiscal_year));
            }

            AttemptOutcome::Accept(PeriodVerdict::Periods(PeriodSpec::ApplyAll {
                fiscal_year,
                quarters,
            }))
        }
        Some(PeriodCall::PeriodsSpecific { .. }) => {
            let records = calls.iter().flat_map(|call| match call {
                PeriodCall::PeriodsSpecific { periods } => {
                    periods.iter().cloned().map(EntityPeriods::from).collect::<Vec<_>>()
                }
                _ => Vec::new(),
            });
            entity_specific(records, entity_ids, availability)
        }
    }
}

/// Merge records on (entity, year) and keep only requested entities and
/// quarters that have data.
fn entity_specific(
    records: impl IntoIterator<Item = EntityPeriods>,
    entity_ids: &BTreeSet<i64>,
    availability: &Availability,
) -> AttemptOutcome<PeriodVerdict> {
    let periods: Vec<EntityPeriods> = merge_entity_periods(records)
        .into_iter()
        .filter_map(|mut record| {
            if !entity_ids.contains(&record.entity_id) {
                warn!(entity_id = record.entity_id, "Dropping periods for an unrequested entity");
                return None;
            }
            record.quarters.retain(|q| {
                let available = availability.has_period(record.entity_id, record.fiscal_year, *q);
                if !available {
                    warn!(
                        entity_id = record.entity_id,
                        fiscal_year = record.fiscal_year,
                        quarter = %q,
                        "Dropping quarter with no data"
                    );
                }
                available
            });
            (!record.quarters.is_empty()).then_some(record)
        })
        .collect();

    if periods.is_empty() {
        return AttemptOutcome::Reject("no available entity periods returned".to_string());
    }

    AttemptOutcome::Accept(PeriodVerdict::Periods(PeriodSpec::EntitySpecific { periods }))
}

fn interpret_validity(completion: &Completion) -> AttemptOutcome<PeriodVerdict> {
    let calls = recognised_calls(completion);

    let question = calls.iter().find_map(|call| match call {
        PeriodCall::PeriodClarification { question } if !question.trim().is_empty() => Some(question.as_str()),
        _ => None,
    });

    match calls.first() {
        None => AttemptOutcome::Reject("no recognised tool call".to_string()),
        Some(PeriodCall::PeriodsValid { periods_clear: true }) => AttemptOutcome::Accept(PeriodVerdict::Clear),
        Some(PeriodCall::PeriodsValid { periods_clear: false }) => match question {
            Some(question) => clarification_from(question),
            None => AttemptOutcome::Reject("periods unclear but no clarification question".to_string()),
        },
        Some(PeriodCall::PeriodClarification { question }) => clarification_from(question),
        Some(_) => AttemptOutcome::Reject("period selection is not accepted before banks are known".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{MockCompletionService, ToolCall};
    use crate::testing::{conversation, run_context, sample_catalog};
    use crate::catalog::AvailabilityCatalog;
    use std::sync::Arc;

    fn quarters(qs: &[Quarter]) -> BTreeSet<Quarter> {
        qs.iter().copied().collect()
    }

    async fn detail(ids: &[i64]) -> BTreeMap<i64, BankEntity> {
        let banks = sample_catalog().banks(None).await.unwrap();
        ids.iter().map(|id| (*id, banks[id].clone())).collect()
    }

    #[test]
    fn test_composite_key_merge() {
        let merged = merge_entity_periods(vec![
            EntityPeriods {
                entity_id: 1,
                fiscal_year: 2024,
                quarters: quarters(&[Quarter::Q1]),
            },
            EntityPeriods {
                entity_id: 1,
                fiscal_year: 2024,
                quarters: quarters(&[Quarter::Q2]),
            },
            EntityPeriods {
                entity_id: 1,
                fiscal_year: 2023,
                quarters: quarters(&[Quarter::Q4]),
            },
        ]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].fiscal_year, 2023);
        assert_eq!(
            merged[1],
            EntityPeriods {
                entity_id: 1,
                fiscal_year: 2024,
                quarters: quarters(&[Quarter::Q1, Quarter::Q2]),
            }
        );
    }

    #[tokio::test]
    async fn test_periods_specific_calls_accumulate() {
        let mock = Arc::new(MockCompletionService::new().reply_tool_calls(vec![
            ToolCall::new(
                "periods_specific",
                json!({ "periods": [{ "entity_id": 1, "fiscal_year": 2024, "quarters": ["Q1"] }] }),
            ),
            ToolCall::new(
                "periods_specific",
                json!({ "periods": [
                    { "entity_id": 1.0, "fiscal_year": "2024", "quarters": [2] },
                    { "entity_id": 99, "fiscal_year": 2024, "quarters": ["Q1"] }
                ] }),
            ),
        ]));
        let (ctx, _) = run_context(mock).await;
        let ids: BTreeSet<i64> = [1, 2].into_iter().collect();

        let result = extract_periods(&conversation("RY H1 2024"), &ids, &detail(&[1, 2]).await, "revenue", &ctx).await;
        assert_eq!(result.status, ExtractionStatus::Success);
        assert_eq!(
            result.periods,
            Some(PeriodSpec::EntitySpecific {
                periods: vec![EntityPeriods {
                    entity_id: 1,
                    fiscal_year: 2024,
                    quarters: quarters(&[Quarter::Q1, Quarter::Q2]),
                }],
            })
        );
    }

    #[tokio::test]
    async fn test_periods_all_drops_unavailable_quarters() {
        let mock = Arc::new(MockCompletionService::new().reply_tool_call(
            "periods_all",
            json!({ "fiscal_year": 2024, "quarters": ["Q3", "Q4"] }),
        ));
        let (ctx, _) = run_context(mock.clone()).await;
        let ids: BTreeSet<i64> = [1, 2].into_iter().collect();

        let result = extract_periods(&conversation("Q3 and Q4 2024"), &ids, &detail(&[1, 2]).await, "revenue", &ctx).await;
        assert_eq!(
            result.periods,
            Some(PeriodSpec::ApplyAll {
                fiscal_year: 2024,
                quarters: quarters(&[Quarter::Q3]),
            })
        );

        // Intent and availability reach the prompt
        let system = &mock.requests()[0].messages[0].content;
        assert!(system.contains("Intent: revenue"));
        assert!(system.contains("| 2 | Toronto-Dominion Bank (TD) | transcripts | 2024 |"));
    }

    #[tokio::test]
    async fn test_periods_all_across_years_keeps_every_year() {
        let mock = Arc::new(MockCompletionService::new().reply_tool_calls(vec![
            ToolCall::new("periods_all", json!({ "fiscal_year": 2023, "quarters": ["Q4"] })),
            ToolCall::new("periods_all", json!({ "fiscal_year": 2024, "quarters": ["Q1"] })),
        ]));
        let (ctx, _) = run_context(mock).await;
        let ids: BTreeSet<i64> = [1, 2].into_iter().collect();

        let result = extract_periods(
            &conversation("Q4 2023 and Q1 2024"),
            &ids,
            &detail(&[1, 2]).await,
            "revenue",
            &ctx,
        )
        .await;

        assert_eq!(result.status, ExtractionStatus::Success);
        // TD has nothing for FY2023, so only RY keeps that year
        assert_eq!(
            result.periods,
            Some(PeriodSpec::EntitySpecific {
                periods: vec![
                    EntityPeriods {
                        entity_id: 1,
                        fiscal_year: 2023,
                        quarters: quarters(&[Quarter::Q4]),
                    },
                    EntityPeriods {
                        entity_id: 1,
                        fiscal_year: 2024,
                        quarters: quarters(&[Quarter::Q1]),
                    },
                    EntityPeriods {
                        entity_id: 2,
                        fiscal_year: 2024,
                        quarters: quarters(&[Quarter::Q1]),
                    },
                ],
            })
        );
    }

    #[tokio::test]
    async fn test_exhaustion_yields_fallback_question() {
        let mock = Arc::new(
            MockCompletionService::new()
                .reply_tool_call("periods_all", json!({ "fiscal_year": 1999, "quarters": ["Q1"] }))
                .reply_tool_call("period_clarification", json!({ "question": "" }))
                .reply_text("no tools here"),
        );
        let (ctx, _) = run_context(mock.clone()).await;
        let ids: BTreeSet<i64> = [1].into_iter().collect();

        let result = extract_periods(&conversation("RY 1999"), &ids, &detail(&[1]).await, "revenue", &ctx).await;
        assert_eq!(mock.calls(), 3);
        assert_eq!(result.status, ExtractionStatus::NeedsClarification);
        assert_eq!(result.clarification.as_deref(), Some(FALLBACK_PERIOD_QUESTION));
    }

    #[tokio::test]
    async fn test_validity_mode() {
        let mock = Arc::new(
            MockCompletionService::new()
                .reply_tool_call("periods_valid", json!({ "periods_clear": false }))
                .reply_tool_calls(vec![
                    ToolCall::new("periods_valid", json!({ "periods_clear": "false" })),
                    ToolCall::new("period_clarification", json!({ "question": "Which quarter?" })),
                ])
                .reply_tool_call("periods_valid", json!({ "periods_clear": true })),
        );
        let (ctx, _) = run_context(mock.clone()).await;
        let none = BTreeSet::new();

        // First reply is unclear without a question and gets retried
        let unclear = extract_periods(&conversation("revenue lately"), &none, &BTreeMap::new(), "", &ctx).await;
        assert_eq!(unclear.status, ExtractionStatus::NeedsClarification);
        assert_eq!(unclear.clarification.as_deref(), Some("Which quarter?"));
        assert_eq!(unclear.attempts, 2);
        assert_eq!(mock.requests()[0].stage, "clarifier_period_validity");

        let clear = extract_periods(&conversation("Q3 2024 revenue"), &none, &BTreeMap::new(), "", &ctx).await;
        assert_eq!(clear.status, ExtractionStatus::Success);
        assert!(clear.periods.is_none());
    }
}
