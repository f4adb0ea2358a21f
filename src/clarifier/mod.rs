//! Clarifier
//!
//! Two-phase extraction: banks first, then periods. Both phases are bounded
//! retries validated against the catalog, and both degrade to a clarification
//! question instead of failing. On success the result is expanded into
//! bank × period combinations.

use crate::catalog::Availability;
use crate::context::RunContext;
use crate::conversation::ConversationState;
use crate::models::{Combination, ExtractionResult, ExtractionStatus, PeriodSpec, Usage};
use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};
use tracing::info;

pub mod banks;
pub mod periods;
pub mod retry;

pub use banks::{extract_entities, EntityExtraction, FALLBACK_BANK_QUESTION};
pub use periods::{extract_periods, merge_entity_periods, PeriodExtraction, FALLBACK_PERIOD_QUESTION};

/// Usage summed across retry attempts
#[derive(Debug, Default)]
pub(crate) struct UsageMeter(Mutex<Usage>);

impl UsageMeter {
    pub(crate) fn add(&self, usage: Usage) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) += usage;
    }

    pub(crate) fn total(&self) -> Usage {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run both phases and collect every clarification question in order
pub async fn clarify(conversation: &ConversationState, ctx: &RunContext) -> ExtractionResult {
    let entities = extract_entities(conversation, ctx).await;

    let result = match entities.status {
        ExtractionStatus::Error => {
            ExtractionResult::error(entities.error.unwrap_or_else(|| "entity extraction failed".to_string()))
        }
        ExtractionStatus::NeedsClarification => {
            // Check the period phrasing now so both questions go out together
            let validity = extract_periods(conversation, &BTreeSet::new(), &entities.entity_detail, "", ctx).await;

            let mut clarifications: Vec<String> = entities.clarification.into_iter().collect();
            if validity.status == ExtractionStatus::NeedsClarification {
                clarifications.extend(validity.clarification);
            }

            ExtractionResult {
                status: ExtractionStatus::NeedsClarification,
                entity_ids: entities.entity_ids,
                entity_detail: entities.entity_detail,
                intent: entities.intent,
                periods: None,
                clarifications,
                combinations: Vec::new(),
                error: None,
            }
        }
        ExtractionStatus::Success => {
            let periods = extract_periods(
                conversation,
                &entities.entity_ids,
                &entities.entity_detail,
                &entities.intent,
                ctx,
            )
            .await;

            let mut result = ExtractionResult {
                status: periods.status,
                entity_ids: entities.entity_ids,
                entity_detail: entities.entity_detail,
                intent: entities.intent,
                periods: periods.periods,
                clarifications: periods.clarification.into_iter().collect(),
                combinations: Vec::new(),
                error: periods.error,
            };

            if result.status == ExtractionStatus::Success {
                if let Some(spec) = &result.periods {
                    result.combinations =
                        expand_combinations(&result.entity_ids, spec, &periods.availability, &result.intent);
                }

                if result.combinations.is_empty() {
                    result.status = ExtractionStatus::NeedsClarification;
                    result.clarifications.push(FALLBACK_PERIOD_QUESTION.to_string());
                }
            }

            result
        }
    };

    info!(
        run_id = %ctx.run_id,
        status = ?result.status,
        combinations = result.combinations.len(),
        clarifications = result.clarifications.len(),
        "Clarifier finished"
    );

    result
}

/// Cross product of entities and their periods. Entities with no matching
/// period contribute nothing; targets without data in any source are skipped.
pub fn expand_combinations(
    entity_ids: &BTreeSet<i64>,
    periods: &PeriodSpec,
    availability: &Availability,
    intent: &str,
) -> Vec<Combination> {
    periods
        .targets(entity_ids)
        .into_iter()
        .filter(|(entity_id, fiscal_year, quarter)| availability.has_period(*entity_id, *fiscal_year, *quarter))
        .map(|(entity_id, fiscal_year, quarter)| Combination {
            entity_id,
            fiscal_year,
            quarter,
            intent: intent.to_string(),
        })
        .collect()
}
