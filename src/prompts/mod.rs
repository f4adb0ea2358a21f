//! Prompt repository
//!
//! Stage prompts and tool schemas. Wording is replaceable; the tool names
//! and argument shapes are what the stages parse against.

use crate::completion::{PromptMessage, ToolSchema};
use crate::conversation::ConversationState;
use crate::error::OrchestrationError;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

pub const ROUTER: &str = "router";
pub const CLARIFIER_BANKS: &str = "clarifier_banks";
pub const CLARIFIER_PERIODS: &str = "clarifier_periods";
pub const CLARIFIER_PERIOD_VALIDITY: &str = "clarifier_period_validity";
pub const PLANNER: &str = "planner";
pub const SUMMARIZER: &str = "summarizer";
pub const DIRECT_RESPONSE: &str = "direct_response";
pub const WORKER: &str = "worker";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagePrompt {
    pub system_prompt: String,
    /// Context block with `{placeholder}` slots
    pub user_prompt_template: String,
    pub tools: Vec<ToolSchema>,
}

impl StagePrompt {
    /// System prompt plus rendered context, followed by the conversation
    pub fn with_conversation(
        &self,
        vars: &[(&str, &str)],
        conversation: &ConversationState,
    ) -> Vec<PromptMessage> {
        let mut system = render_template(&self.system_prompt, vars);
        let context = render_template(&self.user_prompt_template, vars);
        if !context.trim().is_empty() {
            system.push_str("\n\n");
            system.push_str(&context);
        }

        let mut messages = Vec::with_capacity(conversation.len() + 1);
        messages.push(PromptMessage::system(system));
        for msg in conversation.messages() {
            messages.push(PromptMessage {
                role: msg.role,
                content: msg.content.clone(),
            });
        }
        messages
    }

    /// System prompt plus a single rendered user turn
    pub fn standalone(&self, vars: &[(&str, &str)]) -> Vec<PromptMessage> {
        vec![
            PromptMessage::system(render_template(&self.system_prompt, vars)),
            PromptMessage::user(render_template(&self.user_prompt_template, vars)),
        ]
    }
}

/// Source of per-stage prompts
pub trait PromptRepository: Send + Sync {
    fn get(&self, stage: &str) -> Result<StagePrompt>;
}

/// Replace `{name}` placeholders in one pass. Unknown placeholders are left
/// as-is and substituted values are never re-scanned.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let value = tail.find('}').and_then(|close| {
            let name = &tail[1..close];
            vars.iter().find(|(n, _)| *n == name).map(|(_, v)| (*v, close))
        });
        match value {
            Some((value, close)) => {
                out.push_str(value);
                rest = &tail[close + 1..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Default prompts for every stage, with optional overrides
#[derive(Debug, Clone)]
pub struct BuiltinPrompts {
    prompts: HashMap<String, StagePrompt>,
}

impl BuiltinPrompts {
    pub fn new() -> Self {
        let mut prompts = HashMap::new();
        prompts.insert(ROUTER.to_string(), router_prompt());
        prompts.insert(CLARIFIER_BANKS.to_string(), clarifier_banks_prompt());
        prompts.insert(CLARIFIER_PERIODS.to_string(), clarifier_periods_prompt());
        prompts.insert(
            CLARIFIER_PERIOD_VALIDITY.to_string(),
            clarifier_period_validity_prompt(),
        );
        prompts.insert(PLANNER.to_string(), planner_prompt());
        prompts.insert(SUMMARIZER.to_string(), summarizer_prompt());
        prompts.insert(DIRECT_RESPONSE.to_string(), direct_response_prompt());
        prompts.insert(WORKER.to_string(), worker_prompt());

        Self { prompts }
    }

    pub fn with_override(mut self, stage: &str, prompt: StagePrompt) -> Self {
        self.prompts.insert(stage.to_string(), prompt);
        self
    }
}

impl Default for BuiltinPrompts {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptRepository for BuiltinPrompts {
    fn get(&self, stage: &str) -> Result<StagePrompt> {
        self.prompts
            .get(stage)
            .cloned()
            .ok_or_else(|| OrchestrationError::PromptError(format!("no prompt for stage '{}'", stage)))
    }
}

fn tool(name: &str, description: &str, parameters: serde_json::Value) -> ToolSchema {
    ToolSchema {
        name: name.to_string(),
        description: description.to_string(),
        parameters,
    }
}

fn quarters_schema() -> serde_json::Value {
    json!({
        "type": "array",
        "items": { "type": "string", "enum": ["Q1", "Q2", "Q3", "Q4"] }
    })
}

fn router_prompt() -> StagePrompt {
    StagePrompt {
        system_prompt: r#"You are the routing step of a bank financial-data assistant.
Decide whether the latest user message can be answered directly from the
conversation and general knowledge (0), or needs data retrieved from the
bank research sources (1). When unsure, choose 1."#
            .to_string(),
        user_prompt_template: String::new(),
        tools: vec![tool(
            "route_query",
            "Report the routing decision",
            json!({
                "type": "object",
                "properties": {
                    "route": { "type": "integer", "enum": [0, 1], "description": "0 = direct response, 1 = research workflow" },
                    "rationale": { "type": "string" }
                },
                "required": ["route"]
            }),
        )],
    }
}

fn clarifier_banks_prompt() -> StagePrompt {
    StagePrompt {
        system_prompt: r#"Identify which banks the user is asking about, using only the ids in the
bank index. Also state the user's information need as a short intent.
If the banks cannot be determined, ask one short clarification question."#
            .to_string(),
        user_prompt_template: "Bank index:\n{bank_index}".to_string(),
        tools: vec![
            tool(
                "entities_found",
                "The banks were identified",
                json!({
                    "type": "object",
                    "properties": {
                        "ids": { "type": "array", "items": { "type": "integer" } },
                        "intent": { "type": "string" }
                    },
                    "required": ["ids", "intent"]
                }),
            ),
            tool(
                "clarification_needed",
                "The banks are ambiguous or missing",
                json!({
                    "type": "object",
                    "properties": {
                        "question": { "type": "string" },
                        "possible_ids": { "type": "array", "items": { "type": "integer" } }
                    },
                    "required": ["question"]
                }),
            ),
        ],
    }
}

fn clarifier_periods_prompt() -> StagePrompt {
    StagePrompt {
        system_prompt: r#"Identify the fiscal periods the user is asking about for the identified
banks. Use only periods listed in the availability table. Use periods_all
when one year and quarter set applies to every bank, periods_specific when
banks need different periods, and period_clarification when unclear.
Today is {current_date}."#
            .to_string(),
        user_prompt_template: "Banks: {banks}\nIntent: {intent}\n\nAvailability:\n{availability_table}"
            .to_string(),
        tools: vec![
            tool(
                "periods_all",
                "One fiscal year and quarter set for every bank",
                json!({
                    "type": "object",
                    "properties": {
                        "fiscal_year": { "type": "integer" },
                        "quarters": quarters_schema()
                    },
                    "required": ["fiscal_year", "quarters"]
                }),
            ),
            tool(
                "periods_specific",
                "Periods per bank",
                json!({
                    "type": "object",
                    "properties": {
                        "periods": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "entity_id": { "type": "integer" },
                                    "fiscal_year": { "type": "integer" },
                                    "quarters": quarters_schema()
                                },
                                "required": ["entity_id", "fiscal_year", "quarters"]
                            }
                        }
                    },
                    "required": ["periods"]
                }),
            ),
            tool(
                "period_clarification",
                "The period is ambiguous or missing",
                json!({
                    "type": "object",
                    "properties": { "question": { "type": "string" } },
                    "required": ["question"]
                }),
            ),
        ],
    }
}

fn clarifier_period_validity_prompt() -> StagePrompt {
    StagePrompt {
        system_prompt: r#"The banks are not known yet. Only judge whether the time period in the
user's request is clear. If it is not, also ask one short clarification
question. Today is {current_date}."#
            .to_string(),
        user_prompt_template: "Availability:\n{availability_table}".to_string(),
        tools: vec![
            tool(
                "periods_valid",
                "Whether the requested period is clear",
                json!({
                    "type": "object",
                    "properties": { "periods_clear": { "type": "boolean" } },
                    "required": ["periods_clear"]
                }),
            ),
            tool(
                "period_clarification",
                "The period is ambiguous or missing",
                json!({
                    "type": "object",
                    "properties": { "question": { "type": "string" } },
                    "required": ["question"]
                }),
            ),
        ],
    }
}

fn planner_prompt() -> StagePrompt {
    StagePrompt {
        system_prompt: r#"Choose which data sources to query for the user's request. Only choose
from the available sources. Give each chosen source a specific query intent."#
            .to_string(),
        user_prompt_template: r#"Intent: {intent}
Banks: {banks}
Periods: {periods}

Available sources:
{available_sources}"#
            .to_string(),
        tools: vec![
            tool(
                "sources_selected",
                "Sources to query",
                json!({
                    "type": "object",
                    "properties": {
                        "selections": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "source_id": { "type": "string" },
                                    "query_intent": { "type": "string" }
                                },
                                "required": ["source_id", "query_intent"]
                            }
                        }
                    },
                    "required": ["selections"]
                }),
            ),
            tool(
                "no_sources_needed",
                "None of the sources can answer the request",
                json!({
                    "type": "object",
                    "properties": { "reason": { "type": "string" } },
                    "required": ["reason"]
                }),
            ),
        ],
    }
}

fn summarizer_prompt() -> StagePrompt {
    StagePrompt {
        system_prompt: r#"Write a short answer to the user's question from the research results
below. Refer to the sources by name instead of repeating their content.
Mention any source that reported an error."#
            .to_string(),
        user_prompt_template: "Question: {query}\n\nResearch results:\n{source_outputs}".to_string(),
        tools: Vec::new(),
    }
}

fn direct_response_prompt() -> StagePrompt {
    StagePrompt {
        system_prompt: r#"You are a bank financial-data assistant. Answer the latest message
concisely from the conversation. Do not invent figures."#
            .to_string(),
        user_prompt_template: String::new(),
        tools: Vec::new(),
    }
}

fn worker_prompt() -> StagePrompt {
    StagePrompt {
        system_prompt: "You answer research questions from a single data source.".to_string(),
        user_prompt_template: r#"Source: {source_id} ({source_description})
Task: {query_intent}
Bank periods:
{combinations}"#
            .to_string(),
        tools: Vec::new(),
    }
}
