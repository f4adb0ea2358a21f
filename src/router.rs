//! Router
//!
//! Binary classifier deciding whether the latest message can be answered
//! directly or needs the research workflow. Failures never escape: the
//! decision falls back to the research workflow.

use crate::completion::args::lenient_i64;
use crate::completion::CompletionRequest;
use crate::context::RunContext;
use crate::conversation::ConversationState;
use crate::error::OrchestrationError;
use crate::models::{Route, RoutingDecision, StageStatus, Usage};
use crate::monitor::StageRecord;
use crate::prompts;
use crate::Result;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "snake_case")]
enum RouterCall {
    RouteQuery {
        #[serde(deserialize_with = "lenient_i64")]
        route: i64,
        #[serde(default)]
        rationale: String,
    },
}

impl Route {
    fn from_flag(flag: i64) -> Option<Self> {
        match flag {
            0 => Some(Route::DirectResponse),
            1 => Some(Route::ResearchWorkflow),
            _ => None,
        }
    }
}

/// Classify the latest message. Always returns a decision.
pub async fn route(conversation: &ConversationState, ctx: &RunContext) -> RoutingDecision {
    let started = Utc::now();
    let (outcome, usage) = decide(conversation, ctx).await;

    let (decision, error) = match outcome {
        Ok(decision) => (decision, None),
        Err(e) => {
            warn!(run_id = %ctx.run_id, error = %e, "Routing failed, defaulting to research workflow");
            let decision = RoutingDecision {
                route: Route::ResearchWorkflow,
                rationale: "routing unavailable; defaulted to research".to_string(),
                status: StageStatus::Error,
            };
            (decision, Some(e.to_string()))
        }
    };

    info!(run_id = %ctx.run_id, route = ?decision.route, "Routing decided");

    let mut record = StageRecord::new(prompts::ROUTER, started)
        .with_usage(usage)
        .with_details(json!({
            "route": decision.route,
            "rationale": decision.rationale,
            "messages": conversation.len(),
            "fingerprint": conversation.fingerprint(),
        }));
    if let Some(error) = error {
        record = record.with_error(error);
    }
    ctx.ledger.record(record).await;

    decision
}

async fn decide(conversation: &ConversationState, ctx: &RunContext) -> (Result<RoutingDecision>, Usage) {
    let prompt = match ctx.prompts().get(prompts::ROUTER) {
        Ok(prompt) => prompt,
        Err(e) => return (Err(e), Usage::default()),
    };

    let request = CompletionRequest::new(prompts::ROUTER, prompt.with_conversation(&[], conversation))
        .with_required_tools(prompt.tools.clone())
        .with_temperature(0.0);

    let completion = match ctx.completion().invoke(&request).await {
        Ok(completion) => completion,
        Err(e) => return (Err(e), Usage::default()),
    };
    let usage = completion.usage;

    let Some(call) = completion.tool_calls.first() else {
        return (
            Err(OrchestrationError::LlmError(
                "router returned no tool call".to_string(),
            )),
            usage,
        );
    };

    let decision = call.parse::<RouterCall>().and_then(|parsed| match parsed {
        RouterCall::RouteQuery { route, rationale } => Route::from_flag(route)
            .map(|route| RoutingDecision {
                route,
                rationale,
                status: StageStatus::Success,
            })
            .ok_or_else(|| OrchestrationError::LlmError(format!("route flag out of range: {}", route))),
    });

    (decision, usage)
}
