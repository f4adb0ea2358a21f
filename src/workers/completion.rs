//! Model-backed source worker

use super::{SourceWorker, WorkerEmitter, WorkerJob};
use crate::completion::{CompletionRequest, CompletionService};
use crate::error::OrchestrationError;
use crate::models::Usage;
use crate::prompts::{self, PromptRepository};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Answers a source's query intent with a streamed completion
pub struct CompletionWorker {
    source_id: String,
    description: String,
    completion: Arc<dyn CompletionService>,
    prompts: Arc<dyn PromptRepository>,
}

impl CompletionWorker {
    pub fn new(
        source_id: &str,
        description: &str,
        completion: Arc<dyn CompletionService>,
        prompts: Arc<dyn PromptRepository>,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            description: description.to_string(),
            completion,
            prompts,
        }
    }
}

#[async_trait]
impl SourceWorker for CompletionWorker {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, job: WorkerJob, emit: WorkerEmitter) -> Result<Usage> {
        let prompt = self.prompts.get(prompts::WORKER)?;
        let combinations = job.render_combinations();
        let vars = [
            ("source_id", self.source_id.as_str()),
            ("source_description", self.description.as_str()),
            ("query_intent", job.query_intent.as_str()),
            ("combinations", combinations.as_str()),
            ("query", job.query.as_str()),
        ];
        let request = CompletionRequest::new(prompts::WORKER, prompt.standalone(&vars)).with_max_output_tokens(2048);

        debug!(source_id = %self.source_id, combinations = job.combinations.len(), "Completion worker started");

        let (tx, mut rx) = mpsc::channel::<String>(32);
        let forward = async move {
            while let Some(chunk) = rx.recv().await {
                emit.data(chunk).await?;
            }
            Ok::<(), OrchestrationError>(())
        };

        let (usage, forwarded) = tokio::join!(self.completion.stream(&request, tx), forward);
        forwarded?;
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::MockCompletionService;
    use crate::models::{Combination, Quarter, WorkerMessageKind};
    use crate::prompts::BuiltinPrompts;

    fn job() -> WorkerJob {
        WorkerJob {
            source_id: "transcripts".to_string(),
            query_intent: "management commentary on revenue".to_string(),
            combinations: vec![Combination {
                entity_id: 1,
                fiscal_year: 2024,
                quarter: Quarter::Q3,
                intent: "revenue".to_string(),
            }],
            entity_detail: Default::default(),
            query: "RY Q3 2024 revenue".to_string(),
        }
    }

    #[tokio::test]
    async fn test_streams_completion_as_data() {
        let mock = Arc::new(MockCompletionService::new().reply_text("Revenue grew 8%"));
        let worker = CompletionWorker::new(
            "transcripts",
            "Earnings call transcripts",
            mock.clone(),
            Arc::new(BuiltinPrompts::new()),
        );
        let (tx, mut rx) = mpsc::channel(16);

        worker.run(job(), WorkerEmitter::new("transcripts", tx)).await.unwrap();

        let mut text = String::new();
        while let Some(message) = rx.recv().await {
            assert_eq!(message.kind, WorkerMessageKind::Data);
            assert_eq!(message.source_id, "transcripts");
            text.push_str(&message.content);
        }
        assert_eq!(text, "Revenue grew 8%");

        let user = &mock.requests()[0].messages[1].content;
        assert!(user.contains("Task: management commentary on revenue"));
        assert!(user.contains("- bank 1 FY2024 Q3: revenue"));
    }

    #[tokio::test]
    async fn test_completion_failure_is_returned() {
        let mock = Arc::new(MockCompletionService::new().reply_failure("quota exceeded"));
        let worker = CompletionWorker::new("reports", "Reports", mock, Arc::new(BuiltinPrompts::new()));
        let (tx, _rx) = mpsc::channel(16);

        assert!(worker.run(job(), WorkerEmitter::new("reports", tx)).await.is_err());
    }
}
