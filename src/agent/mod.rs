//! Research engine - runs one request end to end
//!
//! ROUTE → CLARIFY → PLAN → DISPATCH/MERGE → SUMMARIZE → FLUSH
//!
//! Only two failures escape `run`: an invalid conversation, and a ledger
//! flush that could not be persisted. Every other stage reports inline.

use crate::clarifier;
use crate::config::EngineConfig;
use crate::context::{RunContext, Services};
use crate::conversation::{ChatMessage, ConversationState};
use crate::dispatch::{Dispatcher, WorkPlan};
use crate::models::{
    source_error_note, Combination, ExtractionStatus, PipelineMessage, Route, WorkerMessage, Usage,
};
use crate::monitor::{MonitorLedger, MonitorSink};
use crate::planner::{self, PlanStatus};
use crate::responder::{ConversationalResponder, DirectResponder};
use crate::router;
use crate::summarizer;
use crate::workers::WorkerRegistry;
use crate::Result;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const NO_DATA_MESSAGE: &str =
    "I couldn't find data covering those banks and periods in any of the available sources.";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    DirectResponse,
    NeedsClarification,
    NoData,
    Researched,
    /// A stage reported an error inline and the run stopped there
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub route: Route,
    pub outcome: RunOutcome,
    pub combinations: Vec<Combination>,
    /// Sources dispatched, in selection order
    pub sources: Vec<String>,
    pub entries_flushed: usize,
    pub usage: Usage,
    pub fingerprint: String,
}

pub struct ResearchEngine {
    config: EngineConfig,
    services: Arc<Services>,
    sink: Arc<dyn MonitorSink>,
    dispatcher: Dispatcher,
    responder: Arc<dyn DirectResponder>,
}

impl ResearchEngine {
    pub fn new(
        config: EngineConfig,
        services: Arc<Services>,
        sink: Arc<dyn MonitorSink>,
        registry: Arc<WorkerRegistry>,
    ) -> Self {
        let dispatcher = Dispatcher::from_config(registry, &config);
        Self {
            config,
            services,
            sink,
            dispatcher,
            responder: Arc::new(ConversationalResponder),
        }
    }

    pub fn with_responder(mut self, responder: Arc<dyn DirectResponder>) -> Self {
        self.responder = responder;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one request, streaming tagged output into `out`.
    pub async fn run(&self, messages: Vec<ChatMessage>, out: mpsc::Sender<PipelineMessage>) -> Result<RunSummary> {
        let start_time = Instant::now();
        let conversation = ConversationState::from_messages(messages, self.config.max_history_messages)?;

        // Fresh ledger per run so concurrent runs never share entries
        let run_id = Uuid::new_v4();
        let ledger = Arc::new(MonitorLedger::new(self.sink.clone()));
        ledger.initialize(run_id, &self.config.engine_name).await;

        let ctx = RunContext::new(run_id, &self.config.engine_name, self.services.clone(), ledger.clone())
            .with_source_filter(self.config.source_filter.clone())
            .with_max_extraction_attempts(self.config.max_extraction_attempts);

        info!(
            run_id = %run_id,
            engine = %self.config.engine_name,
            messages = conversation.len(),
            "Run started"
        );

        // === ROUTE ===
        let decision = router::route(&conversation, &ctx).await;

        let mut summary = RunSummary {
            run_id,
            route: decision.route,
            outcome: RunOutcome::Failed,
            combinations: Vec::new(),
            sources: Vec::new(),
            entries_flushed: 0,
            usage: Usage::default(),
            fingerprint: conversation.fingerprint(),
        };

        let outcome = match decision.route {
            Route::DirectResponse => {
                let responder = self.responder.as_ref();
                let (conversation_ref, ctx_ref) = (&conversation, &ctx);
                relay_text(&out, |tx| async move { responder.respond(conversation_ref, ctx_ref, &tx).await }).await;
                RunOutcome::DirectResponse
            }
            Route::ResearchWorkflow => self.research(&conversation, &ctx, &out, &mut summary).await,
        };
        summary.outcome = outcome;

        // === FLUSH ===
        summary.usage = ledger.totals().await;
        summary.entries_flushed = ledger.flush(run_id).await?;

        info!(
            run_id = %run_id,
            outcome = ?summary.outcome,
            entries = summary.entries_flushed,
            total_tokens = summary.usage.total_tokens(),
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "Run finished"
        );

        Ok(summary)
    }

    async fn research(
        &self,
        conversation: &ConversationState,
        ctx: &RunContext,
        out: &mpsc::Sender<PipelineMessage>,
        summary: &mut RunSummary,
    ) -> RunOutcome {
        // === CLARIFY ===
        let extraction = clarifier::clarify(conversation, ctx).await;
        summary.combinations = extraction.combinations.clone();

        match extraction.status {
            ExtractionStatus::Success => {}
            ExtractionStatus::NeedsClarification => {
                send(out, PipelineMessage::agent_text(extraction.clarifications.join("\n"))).await;
                return RunOutcome::NeedsClarification;
            }
            ExtractionStatus::Error => {
                let detail = extraction.error.as_deref().unwrap_or("extraction failed");
                send(out, PipelineMessage::agent_text(source_error_note("clarifier", detail))).await;
                return RunOutcome::Failed;
            }
        }

        // === PLAN ===
        let plan = planner::plan(conversation, &extraction, ctx).await;
        match plan.status {
            PlanStatus::Success => {}
            PlanStatus::NoData => {
                debug!(run_id = %ctx.run_id, reason = ?plan.reason, "No data for request");
                send(out, PipelineMessage::agent_text(NO_DATA_MESSAGE)).await;
                return RunOutcome::NoData;
            }
            PlanStatus::Error => {
                let detail = plan.reason.as_deref().unwrap_or("planning failed");
                send(out, PipelineMessage::agent_text(source_error_note("planner", detail))).await;
                return RunOutcome::Failed;
            }
        }
        summary.sources = plan.selections.iter().map(|s| s.source_id.clone()).collect();

        // === DISPATCH / MERGE ===
        let query = conversation.latest_text();
        let work = WorkPlan {
            selections: &plan.selections,
            combinations: &extraction.combinations,
            entity_detail: &extraction.entity_detail,
            query,
        };

        let (tx, mut rx) = mpsc::channel::<WorkerMessage>(self.config.merge_channel_capacity.max(1));
        let dispatcher = &self.dispatcher;
        let dispatch = async move {
            let merged = dispatcher.dispatch_and_merge(work, ctx, &tx).await;
            drop(tx);
            merged
        };
        let forward = async {
            while let Some(message) = rx.recv().await {
                if let Some(message) = PipelineMessage::from_worker(&message) {
                    send(out, message).await;
                }
            }
        };
        let (merged, ()) = tokio::join!(dispatch, forward);

        if !merged.failed.is_empty() {
            warn!(run_id = %ctx.run_id, failed = ?merged.failed, "Some sources failed");
        }

        // === SUMMARIZE ===
        send(out, PipelineMessage::summary_start()).await;
        let sources = merged.source_texts.as_slice();
        relay_text(out, |tx| async move {
            summarizer::synthesize(conversation, query, sources, ctx, &tx).await
        })
        .await;

        RunOutcome::Researched
    }
}

/// Run `produce` with a text sender, relaying each chunk as agent text
async fn relay_text<F, Fut, T>(out: &mpsc::Sender<PipelineMessage>, produce: F) -> T
where
    F: FnOnce(mpsc::Sender<String>) -> Fut,
    Fut: Future<Output = T>,
{
    let (tx, mut rx) = mpsc::channel::<String>(32);
    let forward = async {
        while let Some(chunk) = rx.recv().await {
            send(out, PipelineMessage::agent_text(chunk)).await;
        }
    };
    let (value, ()) = tokio::join!(produce(tx), forward);
    value
}

async fn send(out: &mpsc::Sender<PipelineMessage>, message: PipelineMessage) {
    if out.send(message).await.is_err() {
        debug!("Pipeline output closed, dropping message");
    }
}
