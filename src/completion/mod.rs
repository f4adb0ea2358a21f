//! Completion service abstraction
//!
//! The pipeline only needs two things from a language model: a
//! tool-constrained structured answer and a streamed plain-text answer, each
//! with a usage report. Vendors plug in behind `CompletionService`.

use crate::conversation::MessageRole;
use crate::error::OrchestrationError;
use crate::models::Usage;
use crate::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

pub mod args;
pub mod gemini;
pub use gemini::GeminiClient;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: MessageRole,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// A function the model may invoke
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    /// Model decides between text and tools
    Auto,
    /// Model must call one of the offered tools
    Required,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionParams {
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub tool_choice: ToolChoice,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_output_tokens: 1024,
            tool_choice: ToolChoice::Auto,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Pipeline stage issuing the request, for logs and usage attribution
    pub stage: String,
    pub messages: Vec<PromptMessage>,
    pub tools: Vec<ToolSchema>,
    pub params: CompletionParams,
}

impl CompletionRequest {
    pub fn new(stage: &str, messages: Vec<PromptMessage>) -> Self {
        Self {
            stage: stage.to_string(),
            messages,
            tools: Vec::new(),
            params: CompletionParams::default(),
        }
    }

    /// Offer `tools` and require the model to call one of them
    pub fn with_required_tools(mut self, tools: Vec<ToolSchema>) -> Self {
        self.tools = tools;
        self.params.tool_choice = ToolChoice::Required;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.params.temperature = temperature;
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.params.max_output_tokens = max_output_tokens;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub args: Value,
}

impl ToolCall {
    pub fn new(name: &str, args: Value) -> Self {
        Self {
            name: name.to_string(),
            args,
        }
    }

    /// Parse into a stage-specific tagged enum (`#[serde(tag = "name", content = "args")]`).
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        let tagged = serde_json::json!({
            "name": self.name,
            "args": self.args,
        });

        serde_json::from_value(tagged).map_err(|e| {
            OrchestrationError::LlmError(format!("invalid '{}' tool call: {}", self.name, e))
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Completion {
    pub tool_calls: Vec<ToolCall>,
    pub text: Option<String>,
    pub usage: Usage,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn tool_call(name: &str, args: Value) -> Self {
        Self {
            tool_calls: vec![ToolCall::new(name, args)],
            ..Self::default()
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }
}

/// Language model backend
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Single structured completion, optionally constrained to tools
    async fn invoke(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Streamed plain-text completion. Fragments are pushed into `chunks`
    /// as they arrive; the usage report is returned at the end.
    async fn stream(
        &self,
        request: &CompletionRequest,
        chunks: mpsc::Sender<String>,
    ) -> Result<Usage>;
}

/// Stream `request` into `out` while collecting the full text. Fragments
/// keep being collected after `out` closes so the producer never stalls.
pub async fn stream_text(
    service: &dyn CompletionService,
    request: &CompletionRequest,
    out: &mpsc::Sender<String>,
) -> (String, Result<Usage>) {
    let (tx, mut rx) = mpsc::channel::<String>(32);

    let forward = async {
        let mut text = String::new();
        let mut open = true;
        while let Some(chunk) = rx.recv().await {
            text.push_str(&chunk);
            if open && out.send(chunk).await.is_err() {
                open = false;
            }
        }
        text
    };

    let (usage, text) = tokio::join!(service.stream(request, tx), forward);
    (text, usage)
}

//
// ================= Mock =================
//

#[derive(Debug, Clone)]
pub enum MockReply {
    Completion(Completion),
    Failure(String),
}

/// Scripted completion service for development & testing.
/// Replies are consumed in order; once the script runs dry the repeating
/// reply (if any) is served, otherwise the call fails.
pub struct MockCompletionService {
    replies: Mutex<VecDeque<MockReply>>,
    repeat: Option<MockReply>,
    calls: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockCompletionService {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            repeat: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(mut self, reply: MockReply) -> Self {
        self.replies
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
        self
    }

    pub fn reply_tool_call(self, name: &str, args: Value) -> Self {
        self.reply(MockReply::Completion(Completion::tool_call(name, args)))
    }

    pub fn reply_tool_calls(self, calls: Vec<ToolCall>) -> Self {
        self.reply(MockReply::Completion(Completion::tool_calls(calls)))
    }

    pub fn reply_text(self, text: &str) -> Self {
        self.reply(MockReply::Completion(Completion::text(text)))
    }

    pub fn reply_failure(self, message: &str) -> Self {
        self.reply(MockReply::Failure(message.to_string()))
    }

    pub fn repeat(mut self, reply: MockReply) -> Self {
        self.repeat = Some(reply);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_reply(&self, request: &CompletionRequest) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let scripted = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match scripted.or_else(|| self.repeat.clone()) {
            Some(MockReply::Completion(completion)) => Ok(completion),
            Some(MockReply::Failure(message)) => Err(OrchestrationError::LlmError(message)),
            None => Err(OrchestrationError::LlmError(format!(
                "no scripted reply for stage '{}'",
                request.stage
            ))),
        }
    }
}

impl Default for MockCompletionService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionService for MockCompletionService {
    async fn invoke(&self, request: &CompletionRequest) -> Result<Completion> {
        self.next_reply(request)
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        chunks: mpsc::Sender<String>,
    ) -> Result<Usage> {
        let completion = self.next_reply(request)?;

        if let Some(text) = completion.text {
            for piece in text.split_inclusive(' ') {
                if chunks.send(piece.to_string()).await.is_err() {
                    break;
                }
            }
        }

        Ok(completion.usage)
    }
}
