//! Worker dispatcher and merge loop
//!
//! Fans out one task per selected source and multiplexes their messages into
//! a single output channel. Guarantees:
//! - every `start` is sent before any worker is spawned
//! - every source gets exactly one `done`, even when its worker fails, dies
//!   or misses the deadline
//! - a failing worker never affects its siblings

use crate::config::EngineConfig;
use crate::context::RunContext;
use crate::error::OrchestrationError;
use crate::models::{
    source_error_note, BankEntity, Combination, SourceSelection, Usage, WorkerMessage, WorkerMessageKind,
};
use crate::monitor::StageRecord;
use crate::workers::{SourceWorker, WorkerEmitter, WorkerJob, WorkerRegistry};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

pub const STAGE_NAME: &str = "workers";

/// Inputs shared by every worker of one dispatch
#[derive(Debug, Clone, Copy)]
pub struct WorkPlan<'a> {
    pub selections: &'a [SourceSelection],
    pub combinations: &'a [Combination],
    pub entity_detail: &'a BTreeMap<i64, BankEntity>,
    pub query: &'a str,
}

/// Full output of one source, error notes included
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceText {
    pub source_id: String,
    pub text: String,
    pub failed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// In selection order
    pub source_texts: Vec<SourceText>,
    pub failed: Vec<String>,
    /// Sources cut off by the deadline
    pub timed_out: Vec<String>,
    pub usage: Usage,
}

pub struct Dispatcher {
    registry: Arc<WorkerRegistry>,
    poll_interval: Duration,
    deadline: Option<Duration>,
    channel_capacity: usize,
}

impl Dispatcher {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self {
            registry,
            poll_interval: Duration::from_millis(250),
            deadline: None,
            channel_capacity: 64,
        }
    }

    pub fn from_config(registry: Arc<WorkerRegistry>, config: &EngineConfig) -> Self {
        Self::new(registry)
            .with_poll_interval(config.merge_poll_interval)
            .with_deadline(config.worker_timeout)
            .with_channel_capacity(config.merge_channel_capacity)
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    /// Overall deadline for the fan-out. `None` waits for every worker.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Run one worker per selection and relay their messages to `out`.
    pub async fn dispatch_and_merge(
        &self,
        plan: WorkPlan<'_>,
        ctx: &RunContext,
        out: &mpsc::Sender<WorkerMessage>,
    ) -> MergeOutcome {
        let started = Utc::now();

        // Selection order, duplicates collapsed
        let mut seen = BTreeSet::new();
        let selections: Vec<&SourceSelection> = plan
            .selections
            .iter()
            .filter(|s| seen.insert(s.source_id.clone()))
            .collect();

        for selection in &selections {
            relay(out, WorkerMessage::start(&selection.source_id)).await;
        }

        info!(run_id = %ctx.run_id, workers = selections.len(), "Dispatching workers");

        let (tx, mut rx) = mpsc::channel(self.channel_capacity);
        let mut handles: Vec<(String, JoinHandle<Usage>)> = Vec::with_capacity(selections.len());

        for selection in &selections {
            let job = WorkerJob {
                source_id: selection.source_id.clone(),
                query_intent: selection.query_intent.clone(),
                combinations: plan.combinations.to_vec(),
                entity_detail: plan.entity_detail.clone(),
                query: plan.query.to_string(),
            };
            let emitter = WorkerEmitter::new(&selection.source_id, tx.clone());
            let worker = self.registry.get(&selection.source_id);

            handles.push((selection.source_id.clone(), tokio::spawn(run_worker(worker, job, emitter))));
        }
        drop(tx);

        let mut pending: BTreeSet<String> = selections.iter().map(|s| s.source_id.clone()).collect();
        let mut texts: HashMap<String, String> = HashMap::new();
        let mut failed: BTreeSet<String> = BTreeSet::new();
        let deadline = self.deadline.map(|d| Instant::now() + d);
        let mut deadline_hit = false;

        while !pending.is_empty() {
            let wait = match deadline {
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        deadline_hit = true;
                        break;
                    }
                    self.poll_interval.min(at - now)
                }
                None => self.poll_interval,
            };

            match timeout(wait, rx.recv()).await {
                Ok(Some(mut message)) => {
                    absorb(&mut message, &mut pending, &mut texts, &mut failed);
                    relay(out, message).await;
                }
                // Every sender is gone
                Ok(None) => break,
                Err(_) => {
                    if handles.iter().all(|(_, handle)| handle.is_finished()) {
                        while let Ok(mut message) = rx.try_recv() {
                            absorb(&mut message, &mut pending, &mut texts, &mut failed);
                            relay(out, message).await;
                        }
                        break;
                    }
                }
            }
        }

        if deadline_hit {
            for (source_id, handle) in &handles {
                if pending.contains(source_id) {
                    warn!(run_id = %ctx.run_id, source_id = %source_id, "Worker missed the deadline, aborting");
                    handle.abort();
                }
            }
        }

        // Close out sources that never reported done
        let mut timed_out = Vec::new();
        for selection in &selections {
            if !pending.contains(&selection.source_id) {
                continue;
            }
            let source_id = &selection.source_id;
            let detail = if deadline_hit {
                timed_out.push(source_id.clone());
                "timed out before finishing"
            } else {
                "worker stopped without finishing"
            };

            let note = source_error_note(source_id, detail);
            let mut error = WorkerMessage::error(source_id, note);
            absorb(&mut error, &mut pending, &mut texts, &mut failed);
            relay(out, error).await;

            let mut done = WorkerMessage::done(source_id);
            absorb(&mut done, &mut pending, &mut texts, &mut failed);
            relay(out, done).await;
        }

        let mut usage = Usage::default();
        for (source_id, mut handle) in handles {
            match timeout(self.poll_interval, &mut handle).await {
                Ok(Ok(worker_usage)) => usage += worker_usage,
                Ok(Err(e)) if e.is_panic() => {
                    warn!(run_id = %ctx.run_id, source_id = %source_id, "Worker panicked");
                }
                Ok(Err(_)) => {}
                Err(_) => handle.abort(),
            }
        }

        let source_texts: Vec<SourceText> = selections
            .iter()
            .map(|s| SourceText {
                source_id: s.source_id.clone(),
                text: texts.remove(&s.source_id).unwrap_or_default(),
                failed: failed.contains(&s.source_id),
            })
            .collect();
        let failed: Vec<String> = source_texts.iter().filter(|s| s.failed).map(|s| s.source_id.clone()).collect();

        info!(
            run_id = %ctx.run_id,
            workers = source_texts.len(),
            failed = failed.len(),
            timed_out = timed_out.len(),
            "Merge finished"
        );

        let mut record = StageRecord::new(STAGE_NAME, started)
            .with_usage(usage)
            .with_details(json!({
                "sources": source_texts.iter().map(|s| json!({
                    "source_id": s.source_id,
                    "chars": s.text.chars().count(),
                    "failed": s.failed,
                })).collect::<Vec<_>>(),
                "timed_out": timed_out,
            }));
        if !failed.is_empty() {
            record = record.with_error(format!("failed sources: {}", failed.join(", ")));
        }
        ctx.ledger.record(record).await;

        MergeOutcome {
            source_texts,
            failed,
            timed_out,
            usage,
        }
    }
}

/// Worker boundary: failures become an inline note, and `done` is always sent
async fn run_worker(worker: Option<Arc<dyn SourceWorker>>, job: WorkerJob, emit: WorkerEmitter) -> Usage {
    let source_id = job.source_id.clone();

    let result = match worker {
        Some(worker) => worker.run(job, emit.clone()).await,
        None => Err(OrchestrationError::WorkerError(format!(
            "no worker registered for source '{}'",
            source_id
        ))),
    };

    let usage = match result {
        Ok(usage) => usage,
        Err(e) => {
            warn!(source_id = %source_id, error = %e, "Worker failed");
            if emit.error(source_error_note(&source_id, &e.to_string())).await.is_err() {
                debug!(source_id = %source_id, "Merge loop gone before error note");
            }
            Usage::default()
        }
    };

    if emit.done().await.is_err() {
        debug!(source_id = %source_id, "Merge loop gone before done");
    }

    usage
}

/// Folds one message into the merge state. An error note that follows
/// partial text gains a leading newline, so the relayed stream and the
/// summarizer's text stay identical.
fn absorb(
    message: &mut WorkerMessage,
    pending: &mut BTreeSet<String>,
    texts: &mut HashMap<String, String>,
    failed: &mut BTreeSet<String>,
) {
    match message.kind {
        WorkerMessageKind::Start => {}
        WorkerMessageKind::Data => {
            texts.entry(message.source_id.clone()).or_default().push_str(&message.content);
        }
        WorkerMessageKind::Error => {
            failed.insert(message.source_id.clone());
            let text = texts.entry(message.source_id.clone()).or_default();
            if !text.is_empty() {
                message.content.insert(0, '\n');
            }
            text.push_str(&message.content);
        }
        WorkerMessageKind::Done => {
            pending.remove(&message.source_id);
        }
    }
}

async fn relay(out: &mpsc::Sender<WorkerMessage>, message: WorkerMessage) {
    if out.send(message).await.is_err() {
        debug!("Output channel closed, dropping worker message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::MockCompletionService;
    use crate::testing::run_context;
    use crate::Result;
    use async_trait::async_trait;
    use std::future::pending;

    enum Behaviour {
        Chunks(Vec<&'static str>),
        Fail,
        Panic,
        Hang,
    }

    struct ScriptedWorker {
        source_id: &'static str,
        behaviour: Behaviour,
    }

    #[async_trait]
    impl SourceWorker for ScriptedWorker {
        fn source_id(&self) -> &str {
            self.source_id
        }

        fn description(&self) -> &str {
            "scripted"
        }

        async fn run(&self, _job: WorkerJob, emit: WorkerEmitter) -> Result<Usage> {
            match &self.behaviour {
                Behaviour::Chunks(chunks) => {
                    for chunk in chunks {
                        emit.data(*chunk).await?;
                        tokio::task::yield_now().await;
                    }
                    Ok(Usage {
                        prompt_tokens: 5,
                        completion_tokens: 5,
                        cost: 0.0,
                    })
                }
                Behaviour::Fail => {
                    emit.data("partial ").await?;
                    Err(OrchestrationError::WorkerError("upstream 500".to_string()))
                }
                Behaviour::Panic => panic!("worker bug"),
                Behaviour::Hang => {
                    emit.data("slow start").await?;
                    pending::<()>().await;
                    Ok(Usage::default())
                }
            }
        }
    }

    fn registry(workers: Vec<ScriptedWorker>) -> Arc<WorkerRegistry> {
        let mut registry = WorkerRegistry::new();
        for worker in workers {
            registry.register(Arc::new(worker));
        }
        Arc::new(registry)
    }

    fn selections(ids: &[&str]) -> Vec<SourceSelection> {
        ids.iter()
            .map(|id| SourceSelection {
                source_id: id.to_string(),
                query_intent: "revenue".to_string(),
            })
            .collect()
    }

    async fn run(
        dispatcher: &Dispatcher,
        ids: &[&str],
    ) -> (MergeOutcome, Vec<WorkerMessage>, RunContext) {
        let (ctx, _) = run_context(Arc::new(MockCompletionService::new())).await;
        let selections = selections(ids);
        let entity_detail = BTreeMap::new();
        let plan = WorkPlan {
            selections: &selections,
            combinations: &[],
            entity_detail: &entity_detail,
            query: "RY Q3 2024 revenue",
        };

        let (out, mut rx) = mpsc::channel(256);
        let outcome = dispatcher.dispatch_and_merge(plan, &ctx, &out).await;
        drop(out);

        let mut messages = Vec::new();
        while let Some(message) = rx.recv().await {
            messages.push(message);
        }
        (outcome, messages, ctx)
    }

    fn count(messages: &[WorkerMessage], kind: WorkerMessageKind) -> usize {
        messages.iter().filter(|m| m.kind == kind).count()
    }

    #[tokio::test]
    async fn test_starts_first_and_one_done_per_source() {
        let dispatcher = Dispatcher::new(registry(vec![
            ScriptedWorker {
                source_id: "transcripts",
                behaviour: Behaviour::Chunks(vec!["RY ", "revenue ", "rose"]),
            },
            ScriptedWorker {
                source_id: "reports",
                behaviour: Behaviour::Fail,
            },
            ScriptedWorker {
                source_id: "benchmarking",
                behaviour: Behaviour::Chunks(vec!["peer ", "median"]),
            },
        ]));

        let (outcome, messages, ctx) = run(&dispatcher, &["transcripts", "reports", "benchmarking"]).await;

        assert!(messages[..3].iter().all(|m| m.kind == WorkerMessageKind::Start));
        assert_eq!(count(&messages, WorkerMessageKind::Start), 3);
        assert_eq!(count(&messages, WorkerMessageKind::Done), 3);
        for id in ["transcripts", "reports", "benchmarking"] {
            assert_eq!(
                messages
                    .iter()
                    .filter(|m| m.kind == WorkerMessageKind::Done && m.source_id == id)
                    .count(),
                1
            );
        }

        let ids: Vec<&str> = outcome.source_texts.iter().map(|s| s.source_id.as_str()).collect();
        assert_eq!(ids, vec!["transcripts", "reports", "benchmarking"]);
        assert_eq!(outcome.source_texts[0].text, "RY revenue rose");
        assert_eq!(outcome.source_texts[2].text, "peer median");
        assert!(outcome.source_texts[1].failed);
        assert_eq!(outcome.source_texts[1].text, "partial \n⚠ error in reports: Worker error: upstream 500");

        // The client sees the same separator the summarizer does
        let relayed: String = messages
            .iter()
            .filter(|m| m.source_id == "reports")
            .filter(|m| matches!(m.kind, WorkerMessageKind::Data | WorkerMessageKind::Error))
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(relayed, outcome.source_texts[1].text);
        assert_eq!(outcome.failed, vec!["reports".to_string()]);
        assert_eq!(outcome.usage.total_tokens(), 20);

        let entries = ctx.ledger.entries().await;
        assert_eq!(entries.last().map(|e| e.stage_name.as_str()), Some(STAGE_NAME));
    }

    #[tokio::test]
    async fn test_per_source_order_is_preserved() {
        let dispatcher = Dispatcher::new(registry(vec![
            ScriptedWorker {
                source_id: "a",
                behaviour: Behaviour::Chunks(vec!["1", "2", "3", "4"]),
            },
            ScriptedWorker {
                source_id: "b",
                behaviour: Behaviour::Chunks(vec!["x", "y", "z"]),
            },
        ]));

        let (_, messages, _) = run(&dispatcher, &["a", "b"]).await;
        let a: String = messages
            .iter()
            .filter(|m| m.source_id == "a" && m.kind == WorkerMessageKind::Data)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(a, "1234");
        let last_a = messages.iter().rposition(|m| m.source_id == "a").unwrap();
        assert_eq!(messages[last_a].kind, WorkerMessageKind::Done);
    }

    #[tokio::test]
    async fn test_unregistered_source_is_isolated() {
        let dispatcher = Dispatcher::new(registry(vec![ScriptedWorker {
            source_id: "transcripts",
            behaviour: Behaviour::Chunks(vec!["ok"]),
        }]));

        let (outcome, messages, _) = run(&dispatcher, &["transcripts", "ghost"]).await;
        assert_eq!(count(&messages, WorkerMessageKind::Done), 2);
        assert!(outcome.source_texts[1].failed);
        assert!(outcome.source_texts[1].text.contains("no worker registered"));
        assert!(!outcome.source_texts[0].failed);
    }

    #[tokio::test]
    async fn test_panicking_worker_is_closed_out() {
        let dispatcher = Dispatcher::new(registry(vec![
            ScriptedWorker {
                source_id: "good",
                behaviour: Behaviour::Chunks(vec!["fine"]),
            },
            ScriptedWorker {
                source_id: "bad",
                behaviour: Behaviour::Panic,
            },
        ]))
        .with_poll_interval(Duration::from_millis(10));

        let (outcome, messages, _) = run(&dispatcher, &["good", "bad"]).await;
        assert_eq!(count(&messages, WorkerMessageKind::Done), 2);
        assert!(outcome.source_texts[1].failed);
        assert_eq!(
            outcome.source_texts[1].text,
            "⚠ error in bad: worker stopped without finishing"
        );
        assert!(outcome.timed_out.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_aborts_stragglers() {
        let dispatcher = Dispatcher::new(registry(vec![
            ScriptedWorker {
                source_id: "fast",
                behaviour: Behaviour::Chunks(vec!["done quickly"]),
            },
            ScriptedWorker {
                source_id: "slow",
                behaviour: Behaviour::Hang,
            },
        ]))
        .with_poll_interval(Duration::from_millis(10))
        .with_deadline(Some(Duration::from_millis(100)));

        let (outcome, messages, _) = run(&dispatcher, &["fast", "slow"]).await;
        assert_eq!(count(&messages, WorkerMessageKind::Done), 2);
        assert_eq!(outcome.timed_out, vec!["slow".to_string()]);
        assert_eq!(
            outcome.source_texts[1].text,
            "slow start\n⚠ error in slow: timed out before finishing"
        );
        assert_eq!(outcome.source_texts[0].text, "done quickly");
    }

    #[tokio::test]
    async fn test_no_selections_finishes_immediately() {
        let dispatcher = Dispatcher::new(registry(Vec::new()));
        let (outcome, messages, _) = run(&dispatcher, &[]).await;
        assert!(messages.is_empty());
        assert!(outcome.source_texts.is_empty());
    }
}
