//! Bank Research Orchestrator
//!
//! Answers natural-language questions about bank financial data:
//! - routes each request to a direct answer or the research workflow
//! - extracts banks and periods, validated against an availability catalog
//! - selects data sources and fans out one worker per source
//! - merges worker streams into one tagged output and summarizes them
//! - records every stage in a run-scoped monitor ledger
//!
//! PIPELINE:
//! ROUTE → CLARIFY → PLAN → DISPATCH/MERGE → SUMMARIZE → FLUSH

pub mod agent;
pub mod catalog;
pub mod clarifier;
pub mod completion;
pub mod config;
pub mod context;
pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod monitor;
pub mod planner;
pub mod prompts;
pub mod responder;
pub mod router;
pub mod summarizer;
pub mod workers;

#[cfg(test)]
mod testing;

pub use error::Result;

// Re-export common types
pub use agent::{ResearchEngine, RunOutcome, RunSummary};
pub use context::{RunContext, Services};
pub use conversation::ChatMessage;
pub use models::*;
