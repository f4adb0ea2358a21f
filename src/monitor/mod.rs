//! Monitor ledger
//!
//! Run-scoped audit trail. Every stage appends one entry with its timing,
//! decision details and usage; the engine flushes the ledger to a sink at
//! the end of the run.

use crate::error::OrchestrationError;
use crate::models::{StageStatus, Usage};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod sink;
pub use sink::{InMemoryMonitorSink, MonitorSink, PostgresMonitorSink};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl From<Usage> for TokenTotals {
    fn from(usage: Usage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorEntry {
    pub entry_id: Uuid,
    pub run_id: Uuid,
    pub engine_name: String,
    pub stage_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Never below 1 so that sub-millisecond stages still show up
    pub duration_ms: i64,
    pub status: StageStatus,
    pub decision_details: serde_json::Value,
    pub token_totals: TokenTotals,
    pub cost_totals: f64,
    pub error: Option<String>,
}

/// What a stage reports about itself
#[derive(Debug, Clone)]
pub struct StageRecord {
    pub stage_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: StageStatus,
    pub details: serde_json::Value,
    pub error: Option<String>,
    pub usage: Usage,
}

impl StageRecord {
    /// A successful record ending now
    pub fn new(stage_name: &str, start_time: DateTime<Utc>) -> Self {
        Self {
            stage_name: stage_name.to_string(),
            start_time,
            end_time: Utc::now(),
            status: StageStatus::Success,
            details: serde_json::Value::Null,
            error: None,
            usage: Usage::default(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    /// Marks the record as failed
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.status = StageStatus::Error;
        self.error = Some(error.into());
        self
    }

    pub fn ended_at(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = end_time;
        self
    }
}

pub fn duration_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_milliseconds().max(1)
}

#[derive(Debug, Default)]
struct LedgerState {
    run_id: Option<Uuid>,
    engine_name: String,
    entries: Vec<MonitorEntry>,
}

/// Append-only ledger for one run at a time
pub struct MonitorLedger {
    sink: Arc<dyn MonitorSink>,
    state: RwLock<LedgerState>,
}

impl MonitorLedger {
    pub fn new(sink: Arc<dyn MonitorSink>) -> Self {
        Self {
            sink,
            state: RwLock::new(LedgerState::default()),
        }
    }

    /// Reset the entry list for a new run
    pub async fn initialize(&self, run_id: Uuid, engine_name: &str) {
        let mut state = self.state.write().await;
        if !state.entries.is_empty() {
            warn!(
                previous_run = ?state.run_id,
                dropped = state.entries.len(),
                "Monitor ledger re-initialised with unflushed entries"
            );
        }
        state.run_id = Some(run_id);
        state.engine_name = engine_name.to_string();
        state.entries.clear();

        debug!(%run_id, engine = engine_name, "Monitor ledger initialised");
    }

    pub async fn record(&self, record: StageRecord) {
        let mut state = self.state.write().await;

        let entry = MonitorEntry {
            entry_id: Uuid::new_v4(),
            run_id: state.run_id.unwrap_or_else(Uuid::nil),
            engine_name: state.engine_name.clone(),
            stage_name: record.stage_name,
            start_time: record.start_time,
            end_time: record.end_time,
            duration_ms: duration_ms(record.start_time, record.end_time),
            status: record.status,
            decision_details: record.details,
            token_totals: record.usage.into(),
            cost_totals: record.usage.cost,
            error: record.error,
        };

        debug!(
            stage = %entry.stage_name,
            duration_ms = entry.duration_ms,
            status = ?entry.status,
            "Stage recorded"
        );

        state.entries.push(entry);
    }

    pub async fn entries(&self) -> Vec<MonitorEntry> {
        self.state.read().await.entries.clone()
    }

    /// Usage summed over every recorded stage
    pub async fn totals(&self) -> Usage {
        self.state
            .read()
            .await
            .entries
            .iter()
            .fold(Usage::default(), |acc, e| {
                acc + Usage {
                    prompt_tokens: e.token_totals.prompt_tokens,
                    completion_tokens: e.token_totals.completion_tokens,
                    cost: e.cost_totals,
                }
            })
    }

    /// Persist and clear all entries. Sink failures are returned to the
    /// caller and the entries are kept.
    pub async fn flush(&self, run_id: Uuid) -> Result<usize> {
        let mut state = self.state.write().await;

        if state.run_id != Some(run_id) {
            return Err(OrchestrationError::PersistenceError(format!(
                "ledger holds run {:?}, asked to flush {}",
                state.run_id, run_id
            )));
        }

        if state.entries.is_empty() {
            return Ok(0);
        }

        let inserted = self.sink.append_batch(run_id, &state.entries).await?;

        info!(%run_id, inserted, "Monitor ledger flushed");

        state.entries.clear();
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;

    struct FailingSink;

    #[async_trait]
    impl MonitorSink for FailingSink {
        async fn append_batch(&self, _run_id: Uuid, _entries: &[MonitorEntry]) -> Result<usize> {
            Err(OrchestrationError::PersistenceError("sink offline".to_string()))
        }
    }

    #[test]
    fn test_duration_is_at_least_one_ms() {
        let now = Utc::now();
        assert_eq!(duration_ms(now, now), 1);
        assert_eq!(duration_ms(now, now + Duration::milliseconds(250)), 250);
    }

    #[tokio::test]
    async fn test_record_and_flush_clears_entries() {
        let sink = Arc::new(InMemoryMonitorSink::new());
        let ledger = MonitorLedger::new(sink.clone());
        let run_id = Uuid::new_v4();
        ledger.initialize(run_id, "test-engine").await;

        let start = Utc::now();
        ledger
            .record(
                StageRecord::new("router", start)
                    .ended_at(start)
                    .with_usage(Usage {
                        prompt_tokens: 10,
                        completion_tokens: 2,
                        cost: 0.01,
                    }),
            )
            .await;
        ledger
            .record(StageRecord::new("planner", start).with_error("model unavailable"))
            .await;

        let entries = ledger.entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].duration_ms, 1);
        assert_eq!(entries[0].engine_name, "test-engine");
        assert_eq!(entries[0].token_totals.total_tokens, 12);
        assert_eq!(entries[1].status, StageStatus::Error);
        assert_eq!(ledger.totals().await.total_tokens(), 12);

        let flushed = ledger.flush(run_id).await.unwrap();
        assert_eq!(flushed, 2);
        assert!(ledger.entries().await.is_empty());
        assert_eq!(sink.entries_for(run_id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_flush_failure_is_surfaced_and_keeps_entries() {
        let ledger = MonitorLedger::new(Arc::new(FailingSink));
        let run_id = Uuid::new_v4();
        ledger.initialize(run_id, "test-engine").await;
        ledger.record(StageRecord::new("router", Utc::now())).await;

        let result = ledger.flush(run_id).await;
        assert!(matches!(result, Err(OrchestrationError::PersistenceError(_))));
        assert_eq!(ledger.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_resets_entries() {
        let ledger = MonitorLedger::new(Arc::new(InMemoryMonitorSink::new()));
        ledger.initialize(Uuid::new_v4(), "e").await;
        ledger.record(StageRecord::new("router", Utc::now())).await;

        let second = Uuid::new_v4();
        ledger.initialize(second, "e").await;
        assert!(ledger.entries().await.is_empty());
        assert_eq!(tokio_test::assert_ok!(ledger.flush(second).await), 0);
    }

    #[tokio::test]
    async fn test_flush_of_other_run_is_rejected() {
        let ledger = MonitorLedger::new(Arc::new(InMemoryMonitorSink::new()));
        ledger.initialize(Uuid::new_v4(), "e").await;
        tokio_test::assert_err!(ledger.flush(Uuid::new_v4()).await);
    }
}
