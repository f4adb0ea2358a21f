//! Shared fixtures for unit tests

use crate::catalog::InMemoryCatalog;
use crate::completion::MockCompletionService;
use crate::context::{RunContext, Services};
use crate::conversation::{ChatMessage, ConversationState};
use crate::models::{BankEntity, Quarter};
use crate::monitor::{InMemoryMonitorSink, MonitorLedger};
use crate::prompts::BuiltinPrompts;
use std::sync::Arc;
use uuid::Uuid;

pub fn bank(id: i64, name: &str, symbol: &str, aliases: &[&str]) -> BankEntity {
    BankEntity {
        id,
        name: name.to_string(),
        symbol: symbol.to_string(),
        aliases: aliases.iter().map(|a| a.to_string()).collect(),
        tags: ["canadian_big_six".to_string()].into_iter().collect(),
        sources: Default::default(),
    }
}

/// RY (1), TD (2) and BMO (3). `benchmarking` only covers RY and BMO only
/// has a 2023 report.
pub fn sample_catalog() -> InMemoryCatalog {
    use Quarter::*;

    InMemoryCatalog::new()
        .with_bank(bank(1, "Royal Bank of Canada", "RY", &["RBC", "Royal Bank"]))
        .with_bank(bank(2, "Toronto-Dominion Bank", "TD", &["TD Bank"]))
        .with_bank(bank(3, "Bank of Montreal", "BMO", &["BMO Financial"]))
        .with_source("transcripts", "Earnings call transcripts")
        .with_source("reports", "Quarterly reports to shareholders")
        .with_source("benchmarking", "Peer benchmarking metrics")
        .with_coverage(1, "transcripts", 2024, &[Q1, Q2, Q3])
        .with_coverage(1, "transcripts", 2023, &[Q4])
        .with_coverage(1, "reports", 2024, &[Q1, Q2, Q3])
        .with_coverage(1, "benchmarking", 2024, &[Q2, Q3])
        .with_coverage(2, "transcripts", 2024, &[Q1, Q2, Q3])
        .with_coverage(2, "reports", 2024, &[Q3])
        .with_coverage(3, "reports", 2023, &[Q4])
}

pub fn services(mock: Arc<MockCompletionService>) -> Arc<Services> {
    Arc::new(Services::new(
        mock,
        sample_catalog().into_shared(),
        Arc::new(BuiltinPrompts::new()),
    ))
}

/// Context with an initialised ledger backed by an in-memory sink
pub async fn run_context(mock: Arc<MockCompletionService>) -> (RunContext, Arc<InMemoryMonitorSink>) {
    let sink = Arc::new(InMemoryMonitorSink::new());
    let ledger = Arc::new(MonitorLedger::new(sink.clone()));
    let run_id = Uuid::new_v4();
    ledger.initialize(run_id, "test-engine").await;

    (RunContext::new(run_id, "test-engine", services(mock), ledger), sink)
}

pub fn conversation(query: &str) -> ConversationState {
    ConversationState::from_messages(vec![ChatMessage::user(query)], 10)
        .unwrap_or_else(|e| panic!("invalid test conversation: {}", e))
}
