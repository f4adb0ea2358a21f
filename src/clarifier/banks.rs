//! Entity phase: which banks is the user asking about

use super::retry::{run_bounded, AttemptOutcome, RetryOutcome};
use super::UsageMeter;
use crate::catalog::render_bank_index;
use crate::completion::args::lenient_i64_list;
use crate::completion::{Completion, CompletionRequest};
use crate::context::RunContext;
use crate::conversation::ConversationState;
use crate::models::{BankEntity, ExtractionStatus};
use crate::monitor::StageRecord;
use crate::prompts;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

pub const FALLBACK_BANK_QUESTION: &str =
    "Which bank or banks would you like me to look at? Please name them (for example, RBC or TD).";

#[derive(Debug, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "snake_case")]
enum EntityCall {
    EntitiesFound {
        #[serde(default, deserialize_with = "lenient_i64_list")]
        ids: Vec<i64>,
        #[serde(default)]
        intent: String,
    },
    ClarificationNeeded {
        #[serde(default)]
        question: String,
        #[serde(default, deserialize_with = "lenient_i64_list")]
        possible_ids: Vec<i64>,
    },
}

#[derive(Debug)]
enum EntityVerdict {
    Found { ids: BTreeSet<i64>, intent: String },
    Clarify { question: String },
}

#[derive(Debug, Clone)]
pub struct EntityExtraction {
    pub status: ExtractionStatus,
    pub entity_ids: BTreeSet<i64>,
    pub entity_detail: BTreeMap<i64, BankEntity>,
    pub intent: String,
    pub clarification: Option<String>,
    pub error: Option<String>,
    pub attempts: u32,
}

impl EntityExtraction {
    fn failed(error: String) -> Self {
        Self {
            status: ExtractionStatus::Error,
            entity_ids: BTreeSet::new(),
            entity_detail: BTreeMap::new(),
            intent: String::new(),
            clarification: None,
            error: Some(error),
            attempts: 0,
        }
    }

    fn clarify(question: String, attempts: u32) -> Self {
        Self {
            status: ExtractionStatus::NeedsClarification,
            clarification: Some(question),
            error: None,
            attempts,
            ..Self::failed(String::new())
        }
    }
}

/// Identify the banks in the conversation, validated against the catalog.
/// Never fails past this boundary: exhaustion yields a fallback question.
pub async fn extract_entities(conversation: &ConversationState, ctx: &RunContext) -> EntityExtraction {
    let started = Utc::now();
    let stage = prompts::CLARIFIER_BANKS;

    let banks = match ctx.catalog().banks(ctx.source_filter()).await {
        Ok(banks) => banks,
        Err(e) => {
            warn!(run_id = %ctx.run_id, error = %e, "Bank index unavailable");
            let result = EntityExtraction::failed(e.to_string());
            ctx.ledger
                .record(StageRecord::new(stage, started).with_error(e.to_string()))
                .await;
            return result;
        }
    };

    let prompt = match ctx.prompts().get(stage) {
        Ok(prompt) => prompt,
        Err(e) => {
            ctx.ledger
                .record(StageRecord::new(stage, started).with_error(e.to_string()))
                .await;
            return EntityExtraction::failed(e.to_string());
        }
    };

    let index = render_bank_index(&banks);
    let request = CompletionRequest::new(
        stage,
        prompt.with_conversation(&[("bank_index", index.as_str())], conversation),
    )
    .with_required_tools(prompt.tools.clone())
    .with_temperature(0.0);

    debug!(run_id = %ctx.run_id, banks = banks.len(), "Extracting entities");

    let meter = UsageMeter::default();
    let (request, banks, meter_ref) = (&request, &banks, &meter);
    let outcome = run_bounded(ctx.max_extraction_attempts, stage, move |_| async move {
        match ctx.completion().invoke(request).await {
            Ok(completion) => {
                meter_ref.add(completion.usage);
                interpret(&completion, banks)
            }
            Err(e) => AttemptOutcome::Reject(format!("completion failed: {}", e)),
        }
    })
    .await;

    let attempts = outcome.attempts();
    let result = match outcome {
        RetryOutcome::Succeeded {
            value: EntityVerdict::Found { ids, intent },
            ..
        } => {
            let entity_detail = ids
                .iter()
                .filter_map(|id| banks.get(id).map(|b| (*id, b.clone())))
                .collect();
            EntityExtraction {
                status: ExtractionStatus::Success,
                entity_ids: ids,
                entity_detail,
                intent,
                clarification: None,
                error: None,
                attempts,
            }
        }
        RetryOutcome::Succeeded {
            value: EntityVerdict::Clarify { question },
            ..
        } => EntityExtraction::clarify(question, attempts),
        RetryOutcome::Exhausted { failures, .. } => {
            warn!(run_id = %ctx.run_id, attempts, "Entity extraction exhausted, asking fallback question");
            debug!(?failures, "Entity extraction failures");
            EntityExtraction::clarify(FALLBACK_BANK_QUESTION.to_string(), attempts)
        }
    };

    info!(
        run_id = %ctx.run_id,
        status = ?result.status,
        entities = result.entity_ids.len(),
        attempts,
        "Entity extraction finished"
    );

    ctx.ledger
        .record(
            StageRecord::new(stage, started)
                .with_usage(meter.total())
                .with_details(json!({
                    "status": result.status,
                    "entity_ids": result.entity_ids,
                    "intent": result.intent,
                    "clarification": result.clarification,
                    "attempts": attempts,
                })),
        )
        .await;

    result
}

/// Judge one completion. The first recognised tool call decides.
fn interpret(completion: &Completion, banks: &BTreeMap<i64, BankEntity>) -> AttemptOutcome<EntityVerdict> {
    let Some(call) = completion
        .tool_calls
        .iter()
        .find_map(|call| match call.parse::<EntityCall>() {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                debug!(error = %e, "Skipping unrecognised tool call");
                None
            }
        })
    else {
        return AttemptOutcome::Reject("no recognised tool call".to_string());
    };

    match call {
        EntityCall::EntitiesFound { ids, intent } => {
            let (known, unknown): (BTreeSet<i64>, BTreeSet<i64>) =
                ids.into_iter().partition(|id| banks.contains_key(id));

            if !unknown.is_empty() {
                warn!(dropped = ?unknown, "Dropping entity ids not in the catalog");
            }

            if known.is_empty() {
                return AttemptOutcome::Reject("no known entity ids returned".to_string());
            }

            let intent = intent.trim().to_string();
            if intent.is_empty() {
                return AttemptOutcome::Reject("entities_found without an intent".to_string());
            }

            AttemptOutcome::Accept(EntityVerdict::Found { ids: known, intent })
        }
        EntityCall::ClarificationNeeded { question, possible_ids } => {
            let question = question.trim().to_string();
            if question.is_empty() {
                return AttemptOutcome::Reject("clarification_needed without a question".to_string());
            }
            debug!(?possible_ids, "Entity clarification requested");
            AttemptOutcome::Accept(EntityVerdict::Clarify { question })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{MockCompletionService, MockReply, ToolCall};
    use crate::testing::{conversation, run_context};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_unknown_ids_are_dropped() {
        let mock = Arc::new(MockCompletionService::new().reply_tool_call(
            "entities_found",
            json!({ "ids": [2, 3, 99], "intent": "revenue" }),
        ));
        let (ctx, _) = run_context(mock.clone()).await;

        let result = extract_entities(&conversation("TD and BMO revenue"), &ctx).await;
        assert_eq!(result.status, ExtractionStatus::Success);
        assert_eq!(result.entity_ids, [2, 3].into_iter().collect());
        assert!(!result.entity_detail.contains_key(&99));
        assert_eq!(result.entity_detail[&2].symbol, "TD");
        assert_eq!(result.intent, "revenue");
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_three_invalid_attempts_yield_fallback_question() {
        let mock = Arc::new(
            MockCompletionService::new().repeat(MockReply::Completion(Completion::tool_call(
                "entities_found",
                json!({ "ids": [], "intent": "" }),
            ))),
        );
        let (ctx, _) = run_context(mock.clone()).await;

        let result = extract_entities(&conversation("revenue please"), &ctx).await;
        assert_eq!(mock.calls(), 3);
        assert_eq!(result.status, ExtractionStatus::NeedsClarification);
        assert_eq!(result.clarification.as_deref(), Some(FALLBACK_BANK_QUESTION));
        assert_eq!(result.attempts, 3);

        // Every attempt resends the same messages
        let requests = mock.requests();
        assert_eq!(requests[0].messages, requests[2].messages);
    }

    #[tokio::test]
    async fn test_completion_errors_count_as_attempts() {
        let mock = Arc::new(
            MockCompletionService::new()
                .reply_failure("timeout")
                .reply_tool_call("entities_found", json!({ "ids": [42], "intent": "revenue" }))
                .reply_tool_call("entities_found", json!({ "ids": ["1"], "intent": "revenue" })),
        );
        let (ctx, _) = run_context(mock.clone()).await;

        let result = extract_entities(&conversation("RBC revenue"), &ctx).await;
        assert_eq!(result.status, ExtractionStatus::Success);
        assert_eq!(result.entity_ids, [1].into_iter().collect());
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn test_empty_intent_is_a_failed_attempt() {
        let mock = Arc::new(
            MockCompletionService::new()
                .reply_tool_call("entities_found", json!({ "ids": [1], "intent": "  " }))
                .reply_tool_call("entities_found", json!({ "ids": [1], "intent": "net income" })),
        );
        let (ctx, _) = run_context(mock).await;

        let result = extract_entities(&conversation("RBC net income"), &ctx).await;
        assert_eq!(result.attempts, 2);
        assert_eq!(result.intent, "net income");
    }

    #[tokio::test]
    async fn test_clarification_needed() {
        let mock = Arc::new(MockCompletionService::new().reply_tool_calls(vec![
            ToolCall::new("made_up_tool", json!({})),
            ToolCall::new(
                "clarification_needed",
                json!({ "question": "Did you mean RBC or BMO?", "possible_ids": [1, 3] }),
            ),
        ]));
        let (ctx, _) = run_context(mock).await;

        let result = extract_entities(&conversation("the big bank"), &ctx).await;
        assert_eq!(result.status, ExtractionStatus::NeedsClarification);
        assert_eq!(result.clarification.as_deref(), Some("Did you mean RBC or BMO?"));
        assert!(result.entity_ids.is_empty());

        let entries = ctx.ledger.entries().await;
        assert_eq!(entries[0].stage_name, "clarifier_banks");
    }

    #[tokio::test]
    async fn test_source_filter_limits_bank_index() {
        let mock = Arc::new(MockCompletionService::new().reply_tool_call(
            "entities_found",
            json!({ "ids": [2], "intent": "revenue" }),
        ));
        let (ctx, _) = run_context(mock.clone()).await;
        let ctx = ctx.with_source_filter(Some(vec!["benchmarking".to_string()]));

        // TD is not covered by benchmarking, so it is not in the index
        let result = extract_entities(&conversation("TD revenue"), &ctx).await;
        assert_eq!(result.status, ExtractionStatus::NeedsClarification);
        assert_eq!(mock.calls(), 3);

        let system = &mock.requests()[0].messages[0].content;
        assert!(system.contains("RY"));
        assert!(!system.contains("Toronto-Dominion"));
    }
}
