//! Summarizer
//!
//! Streams one short answer over the merged worker output. Runs after the
//! retrieval work is done, so a failure here degrades to an inline note and
//! never escapes.

use crate::completion::{stream_text, CompletionRequest};
use crate::context::RunContext;
use crate::conversation::ConversationState;
use crate::dispatch::SourceText;
use crate::models::{source_error_note, StageStatus, Usage};
use crate::monitor::StageRecord;
use crate::prompts;
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub const STAGE_NAME: &str = prompts::SUMMARIZER;

#[derive(Debug, Clone)]
pub struct SynthesisOutcome {
    pub status: StageStatus,
    /// Everything sent to `out`, error note included
    pub text: String,
    pub usage: Usage,
}

/// Source-attributed worker output as the model sees it
pub fn render_source_outputs(sources: &[SourceText]) -> String {
    sources
        .iter()
        .map(|s| {
            let body = if s.text.trim().is_empty() {
                "(no output)"
            } else {
                s.text.trim()
            };
            format!("### {}\n{}", s.source_id, body)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub async fn synthesize(
    conversation: &ConversationState,
    query: &str,
    sources: &[SourceText],
    ctx: &RunContext,
    out: &mpsc::Sender<String>,
) -> SynthesisOutcome {
    let started = Utc::now();
    let source_outputs = render_source_outputs(sources);

    let result = match ctx.prompts().get(STAGE_NAME) {
        Ok(prompt) => {
            let request = CompletionRequest::new(
                STAGE_NAME,
                prompt.with_conversation(
                    &[("query", query), ("source_outputs", source_outputs.as_str())],
                    conversation,
                ),
            )
            .with_max_output_tokens(1024);

            let (text, usage) = stream_text(ctx.completion(), &request, out).await;
            usage.map(|usage| (text, usage)).map_err(|e| e.to_string())
        }
        Err(e) => Err(e.to_string()),
    };

    let outcome = match result {
        Ok((text, usage)) => {
            info!(run_id = %ctx.run_id, chars = text.chars().count(), "Summary streamed");
            SynthesisOutcome {
                status: StageStatus::Success,
                text,
                usage,
            }
        }
        Err(error) => {
            warn!(run_id = %ctx.run_id, error = %error, "Synthesis failed");
            let note = source_error_note(STAGE_NAME, &error);
            if out.send(format!("\n{}", note)).await.is_err() {
                warn!(run_id = %ctx.run_id, "Output closed before the synthesis error note");
            }
            SynthesisOutcome {
                status: StageStatus::Error,
                text: note,
                usage: Usage::default(),
            }
        }
    };

    let mut record = StageRecord::new(STAGE_NAME, started)
        .with_usage(outcome.usage)
        .with_details(json!({
            "sources": sources.iter().map(|s| s.source_id.as_str()).collect::<Vec<_>>(),
            "input_chars": source_outputs.chars().count(),
            "output_chars": outcome.text.chars().count(),
        }));
    if outcome.status == StageStatus::Error {
        record = record.with_error(outcome.text.clone());
    }
    ctx.ledger.record(record).await;

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{Completion, MockCompletionService, MockReply};
    use crate::testing::{conversation, run_context};
    use std::sync::Arc;

    fn sources() -> Vec<SourceText> {
        vec![
            SourceText {
                source_id: "transcripts".to_string(),
                text: "Management cited loan growth.".to_string(),
                failed: false,
            },
            SourceText {
                source_id: "reports".to_string(),
                text: "⚠ error in reports: Worker error: 503".to_string(),
                failed: true,
            },
        ]
    }

    async fn collect(mut rx: mpsc::Receiver<String>) -> String {
        let mut text = String::new();
        while let Some(chunk) = rx.recv().await {
            text.push_str(&chunk);
        }
        text
    }

    #[test]
    fn test_render_source_outputs() {
        let mut inputs = sources();
        inputs.push(SourceText {
            source_id: "benchmarking".to_string(),
            text: "  ".to_string(),
            failed: false,
        });

        let rendered = render_source_outputs(&inputs);
        assert!(rendered.starts_with("### transcripts\nManagement cited loan growth."));
        assert!(rendered.contains("### reports\n⚠ error in reports"));
        assert!(rendered.ends_with("### benchmarking\n(no output)"));
    }

    #[tokio::test]
    async fn test_streams_summary() {
        let mock = Arc::new(MockCompletionService::new().reply(MockReply::Completion(
            Completion::text("Revenue rose per the transcripts.").with_usage(Usage {
                prompt_tokens: 40,
                completion_tokens: 8,
                cost: 0.0,
            }),
        )));
        let (ctx, _) = run_context(mock.clone()).await;
        let (tx, rx) = mpsc::channel(64);

        let outcome = synthesize(&conversation("RY revenue"), "RY revenue", &sources(), &ctx, &tx).await;
        drop(tx);

        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(outcome.text, "Revenue rose per the transcripts.");
        assert_eq!(collect(rx).await, outcome.text);
        assert_eq!(outcome.usage.total_tokens(), 48);

        let system = &mock.requests()[0].messages[0].content;
        assert!(system.contains("Question: RY revenue"));
        assert!(system.contains("### transcripts"));

        let entries = ctx.ledger.entries().await;
        assert_eq!(entries[0].stage_name, STAGE_NAME);
        assert_eq!(entries[0].status, StageStatus::Success);
    }

    #[tokio::test]
    async fn test_failure_degrades_to_inline_note() {
        let mock = Arc::new(MockCompletionService::new().reply_failure("model overloaded"));
        let (ctx, _) = run_context(mock).await;
        let (tx, rx) = mpsc::channel(64);

        let outcome = synthesize(&conversation("RY revenue"), "RY revenue", &sources(), &ctx, &tx).await;
        drop(tx);

        assert_eq!(outcome.status, StageStatus::Error);
        assert_eq!(collect(rx).await, "\n⚠ error in summarizer: LLM error: model overloaded");

        let entries = ctx.ledger.entries().await;
        assert_eq!(entries[0].status, StageStatus::Error);
        assert!(entries[0].error.is_some());
    }
}
