//! Gemini API client
//!
//! Implements `CompletionService` over `generateContent` (function calling)
//! and `streamGenerateContent` (server-sent events).
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::completion::{
    Completion, CompletionRequest, CompletionService, ToolCall, ToolChoice,
};
use crate::config::GeminiConfig;
use crate::conversation::MessageRole;
use crate::error::OrchestrationError;
use crate::models::Usage;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(config.timeout)
            .build()?;

        Ok(Self { client, config })
    }

    /// Method URL. The key travels in the `x-goog-api-key` header, never here.
    fn endpoint(&self, method: &str) -> Result<String> {
        if self.config.api_key.is_empty() {
            return Err(OrchestrationError::LlmError(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let base = self.config.base_url.trim_end_matches('/');
        Ok(format!("{}/{}:{}", base, self.config.model, method))
    }

    fn usage_from(&self, metadata: Option<&UsageMetadata>) -> Usage {
        let Some(metadata) = metadata else {
            return Usage::default();
        };

        let prompt_tokens = metadata.prompt_token_count.unwrap_or(0);
        let completion_tokens = metadata.candidates_token_count.unwrap_or(0);

        Usage {
            prompt_tokens,
            completion_tokens,
            cost: prompt_tokens as f64 / 1000.0 * self.config.cost_per_1k_input
                + completion_tokens as f64 / 1000.0 * self.config.cost_per_1k_output,
        }
    }

    async fn post(&self, url: &str, body: &GeminiRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                let e = e.without_url();
                error!("Gemini API request failed: {}", e);
                OrchestrationError::LlmError(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Gemini API error response: {}", error_text);
            return Err(OrchestrationError::LlmError(format!(
                "Gemini API returned {}: {}",
                status, error_text
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl CompletionService for GeminiClient {
    async fn invoke(&self, request: &CompletionRequest) -> Result<Completion> {
        let url = self.endpoint("generateContent")?;
        let body = build_request(request);

        info!(stage = %request.stage, tools = request.tools.len(), "Calling Gemini API");

        let response = self.post(&url, &body).await?;
        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            let e = e.without_url();
            error!("Failed to parse Gemini response: {}", e);
            OrchestrationError::LlmError(format!("Gemini parse error: {}", e))
        })?;

        let usage = self.usage_from(gemini_response.usage_metadata.as_ref());
        let completion = completion_from_response(gemini_response)?.with_usage(usage);

        debug!(
            stage = %request.stage,
            tool_calls = completion.tool_calls.len(),
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "Gemini response received"
        );

        Ok(completion)
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        chunks: mpsc::Sender<String>,
    ) -> Result<Usage> {
        let url = self.endpoint("streamGenerateContent?alt=sse")?;
        let body = build_request(request);

        info!(stage = %request.stage, "Streaming from Gemini API");

        let mut response = self.post(&url, &body).await?;
        let mut decoder = SseDecoder::default();
        let mut last_usage = None;

        while let Some(bytes) = response.chunk().await.map_err(|e| {
            let e = e.without_url();
            error!("Gemini stream interrupted: {}", e);
            OrchestrationError::LlmError(format!("Gemini stream error: {}", e))
        })? {
            for event in decoder.push(&bytes) {
                let parsed: GeminiResponse = match serde_json::from_str(&event) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        debug!("Skipping unparseable stream event: {}", e);
                        continue;
                    }
                };

                if parsed.usage_metadata.is_some() {
                    last_usage = parsed.usage_metadata.clone();
                }

                for text in candidate_texts(&parsed) {
                    if chunks.send(text).await.is_err() {
                        // Receiver gone; nothing left to stream into.
                        return Ok(self.usage_from(last_usage.as_ref()));
                    }
                }
            }
        }

        Ok(self.usage_from(last_usage.as_ref()))
    }
}

/// Translate a pipeline request into Gemini's wire shape
fn build_request(request: &CompletionRequest) -> GeminiRequest {
    let mut system_parts = Vec::new();
    let mut contents: Vec<Content> = Vec::new();

    for message in &request.messages {
        match message.role {
            MessageRole::System => system_parts.push(Part::text(&message.content)),
            MessageRole::User | MessageRole::Assistant => {
                let role = if message.role == MessageRole::User {
                    "user"
                } else {
                    "model"
                };

                // Gemini requires alternating roles; fold consecutive turns.
                match contents.last_mut() {
                    Some(last) if last.role.as_deref() == Some(role) => {
                        last.parts.push(Part::text(&message.content));
                    }
                    _ => contents.push(Content {
                        role: Some(role.to_string()),
                        parts: vec![Part::text(&message.content)],
                    }),
                }
            }
        }
    }

    let (tools, tool_config) = if request.tools.is_empty() {
        (None, None)
    } else {
        let declarations = request
            .tools
            .iter()
            .map(|tool| FunctionDeclaration {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            })
            .collect();

        let mode = match request.params.tool_choice {
            ToolChoice::Auto => "AUTO",
            ToolChoice::Required => "ANY",
            ToolChoice::None => "NONE",
        };

        (
            Some(vec![Tools {
                function_declarations: declarations,
            }]),
            Some(ToolConfig {
                function_calling_config: FunctionCallingConfig {
                    mode: mode.to_string(),
                },
            }),
        )
    };

    GeminiRequest {
        contents,
        system_instruction: if system_parts.is_empty() {
            None
        } else {
            Some(SystemInstruction {
                parts: system_parts,
            })
        },
        tools,
        tool_config,
        generation_config: GenerationConfig {
            temperature: request.params.temperature,
            max_output_tokens: request.params.max_output_tokens,
        },
    }
}

fn completion_from_response(response: GeminiResponse) -> Result<Completion> {
    let candidate = response.candidates.into_iter().next().ok_or_else(|| {
        OrchestrationError::LlmError("No response from Gemini API".to_string())
    })?;

    let mut tool_calls = Vec::new();
    let mut text = String::new();

    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(call) = part.function_call {
            tool_calls.push(ToolCall {
                name: call.name,
                args: call.args.unwrap_or(Value::Object(Default::default())),
            });
        }
        if let Some(t) = part.text {
            text.push_str(&t);
        }
    }

    Ok(Completion {
        tool_calls,
        text: if text.is_empty() { None } else { Some(text) },
        usage: Usage::default(),
    })
}

fn candidate_texts(response: &GeminiResponse) -> Vec<String> {
    response
        .candidates
        .iter()
        .take(1)
        .filter_map(|c| c.content.as_ref())
        .flat_map(|c| c.parts.iter())
        .filter_map(|p| p.text.clone())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Incremental decoder for `data:` lines of a server-sent event stream.
/// Buffers raw bytes so characters split across chunks stay intact.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed raw bytes; returns the payloads of every complete `data:` line.
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);

            if let Some(payload) = line.strip_prefix("data:") {
                let payload = payload.trim();
                if !payload.is_empty() && payload != "[DONE]" {
                    events.push(payload.to_string());
                }
            }
        }

        events
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Tools>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<ToolConfig>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
}

impl Part {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            function_call: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Tools {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolConfig {
    function_calling_config: FunctionCallingConfig,
}

#[derive(Debug, Serialize)]
struct FunctionCallingConfig {
    mode: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
}
