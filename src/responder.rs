//! Direct responses for queries the router keeps out of the research path

use crate::completion::{stream_text, CompletionRequest};
use crate::context::RunContext;
use crate::conversation::ConversationState;
use crate::models::{source_error_note, StageStatus, Usage};
use crate::monitor::StageRecord;
use crate::prompts;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct DirectReply {
    pub status: StageStatus,
    pub text: String,
    pub usage: Usage,
}

/// Answers a conversation without retrieval. Implementations stream text
/// into `out` and report failures inline rather than returning them.
#[async_trait]
pub trait DirectResponder: Send + Sync {
    async fn respond(
        &self,
        conversation: &ConversationState,
        ctx: &RunContext,
        out: &mpsc::Sender<String>,
    ) -> DirectReply;
}

/// Plain streamed completion over the conversation
#[derive(Debug, Default, Clone, Copy)]
pub struct ConversationalResponder;

#[async_trait]
impl DirectResponder for ConversationalResponder {
    async fn respond(
        &self,
        conversation: &ConversationState,
        ctx: &RunContext,
        out: &mpsc::Sender<String>,
    ) -> DirectReply {
        let started = Utc::now();
        let stage = prompts::DIRECT_RESPONSE;

        let result = match ctx.prompts().get(stage) {
            Ok(prompt) => {
                let request = CompletionRequest::new(stage, prompt.with_conversation(&[], conversation))
                    .with_max_output_tokens(1024);
                let (text, usage) = stream_text(ctx.completion(), &request, out).await;
                usage.map(|usage| (text, usage)).map_err(|e| e.to_string())
            }
            Err(e) => Err(e.to_string()),
        };

        let reply = match result {
            Ok((text, usage)) => {
                info!(run_id = %ctx.run_id, chars = text.chars().count(), "Direct response streamed");
                DirectReply {
                    status: StageStatus::Success,
                    text,
                    usage,
                }
            }
            Err(error) => {
                warn!(run_id = %ctx.run_id, error = %error, "Direct response failed");
                let note = source_error_note("assistant", &error);
                if out.send(note.clone()).await.is_err() {
                    warn!(run_id = %ctx.run_id, "Output closed before the direct response error note");
                }
                DirectReply {
                    status: StageStatus::Error,
                    text: note,
                    usage: Usage::default(),
                }
            }
        };

        let mut record = StageRecord::new(stage, started)
            .with_usage(reply.usage)
            .with_details(json!({ "output_chars": reply.text.chars().count() }));
        if reply.status == StageStatus::Error {
            record = record.with_error(reply.text.clone());
        }
        ctx.ledger.record(record).await;

        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::MockCompletionService;
    use crate::testing::{conversation, run_context};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_streams_reply() {
        let mock = Arc::new(MockCompletionService::new().reply_text("A CET1 ratio measures core capital."));
        let (ctx, _) = run_context(mock.clone()).await;
        let (tx, mut rx) = mpsc::channel(32);

        let reply = ConversationalResponder
            .respond(&conversation("What is a CET1 ratio?"), &ctx, &tx)
            .await;
        drop(tx);

        let mut streamed = String::new();
        while let Some(chunk) = rx.recv().await {
            streamed.push_str(&chunk);
        }
        assert_eq!(reply.status, StageStatus::Success);
        assert_eq!(streamed, "A CET1 ratio measures core capital.");

        let request = &mock.requests()[0];
        assert_eq!(request.stage, prompts::DIRECT_RESPONSE);
        assert_eq!(request.messages.last().map(|m| m.content.as_str()), Some("What is a CET1 ratio?"));
    }

    #[tokio::test]
    async fn test_failure_is_inline() {
        let mock = Arc::new(MockCompletionService::new().reply_failure("unavailable"));
        let (ctx, _) = run_context(mock).await;
        let (tx, mut rx) = mpsc::channel(32);

        let reply = ConversationalResponder.respond(&conversation("hi"), &ctx, &tx).await;
        drop(tx);

        assert_eq!(reply.status, StageStatus::Error);
        assert_eq!(rx.recv().await.as_deref(), Some("⚠ error in assistant: LLM error: unavailable"));
        assert_eq!(ctx.ledger.entries().await[0].stage_name, prompts::DIRECT_RESPONSE);
    }
}
