//! Persistence sinks for the monitor ledger

use crate::error::OrchestrationError;
use crate::monitor::MonitorEntry;
use crate::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::info;
use uuid::Uuid;

/// Destination for flushed ledger entries
#[async_trait]
pub trait MonitorSink: Send + Sync {
    /// Persist a batch, returning how many entries were written
    async fn append_batch(&self, run_id: Uuid, entries: &[MonitorEntry]) -> Result<usize>;
}

/// In-memory sink for development
pub struct InMemoryMonitorSink {
    batches: Arc<RwLock<HashMap<Uuid, Vec<MonitorEntry>>>>,
}

impl InMemoryMonitorSink {
    pub fn new() -> Self {
        Self {
            batches: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn entries_for(&self, run_id: Uuid) -> Vec<MonitorEntry> {
        self.batches
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for InMemoryMonitorSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MonitorSink for InMemoryMonitorSink {
    async fn append_batch(&self, run_id: Uuid, entries: &[MonitorEntry]) -> Result<usize> {
        let mut batches = self.batches.write().await;
        batches
            .entry(run_id)
            .or_insert_with(Vec::new)
            .extend_from_slice(entries);
        Ok(entries.len())
    }
}

/// Postgres sink. The table is created on first use.
pub struct PostgresMonitorSink {
    pool: PgPool,
    schema_ready: OnceCell<()>,
}

impl PostgresMonitorSink {
    /// Lazily connecting pool; nothing is contacted until the first flush
    pub fn connect_lazy(url: &str, max_connections: u32) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_lazy(url)
            .map_err(|e| {
                OrchestrationError::DatabaseError(format!(
                    "Failed to configure monitor database pool: {}",
                    e
                ))
            })?;

        info!("Monitor sink backend: postgres");

        Ok(Self {
            pool,
            schema_ready: OnceCell::new(),
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS monitor_entries (
                      entry_id UUID PRIMARY KEY,
                      run_id UUID NOT NULL,
                      engine_name TEXT NOT NULL,
                      stage_name TEXT NOT NULL,
                      start_time TIMESTAMPTZ NOT NULL,
                      end_time TIMESTAMPTZ NOT NULL,
                      duration_ms BIGINT NOT NULL,
                      status TEXT NOT NULL,
                      decision_details TEXT,
                      prompt_tokens BIGINT NOT NULL DEFAULT 0,
                      completion_tokens BIGINT NOT NULL DEFAULT 0,
                      total_tokens BIGINT NOT NULL DEFAULT 0,
                      total_cost DOUBLE PRECISION NOT NULL DEFAULT 0,
                      error TEXT
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_monitor_entries_run
                    ON monitor_entries (run_id, start_time);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestrationError::PersistenceError(format!(
                    "Failed to initialize monitor schema: {}",
                    e
                ))
            })?;

        Ok(())
    }
}

#[async_trait]
impl MonitorSink for PostgresMonitorSink {
    async fn append_batch(&self, run_id: Uuid, entries: &[MonitorEntry]) -> Result<usize> {
        self.ensure_schema().await?;

        let mut tx = self.pool.begin().await.map_err(|e| {
            OrchestrationError::PersistenceError(format!(
                "Failed to begin monitor transaction: {}",
                e
            ))
        })?;

        for entry in entries {
            let status = match entry.status {
                crate::models::StageStatus::Success => "success",
                crate::models::StageStatus::Error => "error",
            };

            sqlx::query(
                r#"
                INSERT INTO monitor_entries
                  (entry_id, run_id, engine_name, stage_name, start_time, end_time, duration_ms,
                   status, decision_details, prompt_tokens, completion_tokens, total_tokens, total_cost, error)
                VALUES
                  ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
            )
            .bind(entry.entry_id)
            .bind(run_id)
            .bind(&entry.engine_name)
            .bind(&entry.stage_name)
            .bind(entry.start_time)
            .bind(entry.end_time)
            .bind(entry.duration_ms)
            .bind(status)
            .bind(entry.decision_details.to_string())
            .bind(entry.token_totals.prompt_tokens as i64)
            .bind(entry.token_totals.completion_tokens as i64)
            .bind(entry.token_totals.total_tokens as i64)
            .bind(entry.cost_totals)
            .bind(&entry.error)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                OrchestrationError::PersistenceError(format!(
                    "Failed to insert monitor entry: {}",
                    e
                ))
            })?;
        }

        tx.commit().await.map_err(|e| {
            OrchestrationError::PersistenceError(format!(
                "Failed to commit monitor entries: {}",
                e
            ))
        })?;

        Ok(entries.len())
    }
}
