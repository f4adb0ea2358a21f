//! Source workers
//!
//! One worker per data source. A worker streams `data` messages for its
//! source through a `WorkerEmitter`; the dispatcher owns `start`, `done` and
//! failure handling.

use crate::error::OrchestrationError;
use crate::models::{BankEntity, Combination, Usage, WorkerMessage};
use crate::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod completion;
pub mod http;

pub use completion::CompletionWorker;
pub use http::HttpSourceWorker;

/// Everything one worker needs to produce its source's output
#[derive(Debug, Clone)]
pub struct WorkerJob {
    pub source_id: String,
    pub query_intent: String,
    pub combinations: Vec<Combination>,
    pub entity_detail: BTreeMap<i64, BankEntity>,
    /// Latest user message
    pub query: String,
}

impl WorkerJob {
    /// One line per combination, e.g. `- RY FY2024 Q3: revenue`
    pub fn render_combinations(&self) -> String {
        self.combinations
            .iter()
            .map(|c| {
                let bank = self
                    .entity_detail
                    .get(&c.entity_id)
                    .map(|b| b.symbol.clone())
                    .unwrap_or_else(|| format!("bank {}", c.entity_id));
                format!("- {} FY{} {}: {}", bank, c.fiscal_year, c.quarter, c.intent)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Tags every message with the worker's source id
#[derive(Debug, Clone)]
pub struct WorkerEmitter {
    source_id: String,
    tx: mpsc::Sender<WorkerMessage>,
}

impl WorkerEmitter {
    pub fn new(source_id: &str, tx: mpsc::Sender<WorkerMessage>) -> Self {
        Self {
            source_id: source_id.to_string(),
            tx,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Stream a piece of output. Fails once the merge loop has gone away.
    pub async fn data(&self, content: impl Into<String>) -> Result<()> {
        self.send(WorkerMessage::data(&self.source_id, content)).await
    }

    pub(crate) async fn error(&self, content: impl Into<String>) -> Result<()> {
        self.send(WorkerMessage::error(&self.source_id, content)).await
    }

    pub(crate) async fn done(&self) -> Result<()> {
        self.send(WorkerMessage::done(&self.source_id)).await
    }

    async fn send(&self, message: WorkerMessage) -> Result<()> {
        self.tx.send(message).await.map_err(|_| {
            OrchestrationError::WorkerError(format!("merge channel closed for {}", self.source_id))
        })
    }
}

/// A worker retrieving or producing data for one source
#[async_trait]
pub trait SourceWorker: Send + Sync {
    fn source_id(&self) -> &str;
    fn description(&self) -> &str;
    /// Stream output through `emit`; returns model usage, if any
    async fn run(&self, job: WorkerJob, emit: WorkerEmitter) -> Result<Usage>;
}

/// Workers keyed by source id
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn SourceWorker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }

    pub fn register(&mut self, worker: Arc<dyn SourceWorker>) {
        self.workers.insert(worker.source_id().to_string(), worker);
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<dyn SourceWorker>> {
        self.workers.get(source_id).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.workers.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Quarter, WorkerMessageKind};
    use crate::testing::bank;

    struct EchoWorker;

    #[async_trait]
    impl SourceWorker for EchoWorker {
        fn source_id(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes the query"
        }

        async fn run(&self, job: WorkerJob, emit: WorkerEmitter) -> Result<Usage> {
            emit.data(job.query).await?;
            Ok(Usage::default())
        }
    }

    #[test]
    fn test_registry() {
        let mut registry = WorkerRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(EchoWorker));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.list(), vec!["echo"]);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("reports").is_none());
    }

    #[tokio::test]
    async fn test_emitter_tags_messages() {
        let (tx, mut rx) = mpsc::channel(4);
        let emit = WorkerEmitter::new("echo", tx);

        emit.data("hello").await.unwrap();
        emit.done().await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.source_id, "echo");
        assert_eq!(first.kind, WorkerMessageKind::Data);
        assert_eq!(first.content, "hello");
        assert_eq!(rx.recv().await.unwrap().kind, WorkerMessageKind::Done);

        drop(rx);
        assert!(emit.data("late").await.is_err());
    }

    #[test]
    fn test_render_combinations() {
        let job = WorkerJob {
            source_id: "reports".to_string(),
            query_intent: "revenue".to_string(),
            combinations: vec![Combination {
                entity_id: 1,
                fiscal_year: 2024,
                quarter: Quarter::Q3,
                intent: "revenue".to_string(),
            }],
            entity_detail: [(1, bank(1, "Royal Bank of Canada", "RY", &[]))].into_iter().collect(),
            query: "RY Q3".to_string(),
        };
        assert_eq!(job.render_combinations(), "- RY FY2024 Q3: revenue");
    }
}
