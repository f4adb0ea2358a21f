//! Financial API source worker
//!
//! POSTs the job to `{base_url}/sources/{source_id}` and streams the
//! response body back as it arrives.

use super::{SourceWorker, WorkerEmitter, WorkerJob};
use crate::error::OrchestrationError;
use crate::models::Usage;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error};

pub struct HttpSourceWorker {
    source_id: String,
    description: String,
    client: Client,
    base_url: String,
}

impl HttpSourceWorker {
    pub fn new(source_id: &str, description: &str, base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            source_id: source_id.to_string(),
            description: description.to_string(),
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self) -> String {
        format!("{}/sources/{}", self.base_url, self.source_id)
    }
}

fn request_body(job: &WorkerJob) -> Value {
    let combinations: Vec<Value> = job
        .combinations
        .iter()
        .map(|c| {
            json!({
                "entity_id": c.entity_id,
                "symbol": job.entity_detail.get(&c.entity_id).map(|b| b.symbol.as_str()),
                "fiscal_year": c.fiscal_year,
                "quarter": c.quarter,
                "intent": c.intent,
            })
        })
        .collect();

    json!({
        "source_id": job.source_id,
        "query": job.query,
        "query_intent": job.query_intent,
        "combinations": combinations,
    })
}

/// Splits a byte stream into UTF-8 text without breaking multi-byte chars
#[derive(Debug, Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let valid = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            // Invalid sequence, not just a split one
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                return Some(text);
            }
        };

        if valid == 0 {
            return None;
        }

        let rest = self.pending.split_off(valid);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        Some(text)
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

#[async_trait]
impl SourceWorker for HttpSourceWorker {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, job: WorkerJob, emit: WorkerEmitter) -> Result<Usage> {
        let url = self.url();
        debug!(source_id = %self.source_id, %url, "Calling financial API");

        let mut response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request_body(&job))
            .send()
            .await
            .map_err(|e| {
                error!(source_id = %self.source_id, "Financial API request failed: {}", e);
                OrchestrationError::WorkerError(format!("Financial API request failed for {}: {}", self.source_id, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestrationError::WorkerError(format!(
                "Financial API returned {} for {}: {}",
                status, self.source_id, body
            )));
        }

        let mut chunker = Utf8Chunker::default();
        while let Some(bytes) = response.chunk().await? {
            if let Some(text) = chunker.push(&bytes) {
                emit.data(text).await?;
            }
        }
        if let Some(text) = chunker.finish() {
            emit.data(text).await?;
        }

        Ok(Usage::default())
    }
}
