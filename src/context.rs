//! Injected services and per-run context

use crate::catalog::AvailabilityCatalog;
use crate::completion::CompletionService;
use crate::monitor::MonitorLedger;
use crate::prompts::PromptRepository;
use std::sync::Arc;
use uuid::Uuid;

/// External collaborators, built once by the caller
#[derive(Clone)]
pub struct Services {
    pub completion: Arc<dyn CompletionService>,
    pub catalog: Arc<dyn AvailabilityCatalog>,
    pub prompts: Arc<dyn PromptRepository>,
}

impl Services {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        catalog: Arc<dyn AvailabilityCatalog>,
        prompts: Arc<dyn PromptRepository>,
    ) -> Self {
        Self {
            completion,
            catalog,
            prompts,
        }
    }
}

/// Everything a stage needs for one run
#[derive(Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub engine_name: String,
    pub services: Arc<Services>,
    pub ledger: Arc<MonitorLedger>,
    /// Caller-supplied subset of data sources
    pub source_filter: Option<Vec<String>>,
    pub max_extraction_attempts: u32,
}

impl RunContext {
    pub fn new(
        run_id: Uuid,
        engine_name: &str,
        services: Arc<Services>,
        ledger: Arc<MonitorLedger>,
    ) -> Self {
        Self {
            run_id,
            engine_name: engine_name.to_string(),
            services,
            ledger,
            source_filter: None,
            max_extraction_attempts: 3,
        }
    }

    pub fn with_source_filter(mut self, source_filter: Option<Vec<String>>) -> Self {
        self.source_filter = source_filter;
        self
    }

    pub fn with_max_extraction_attempts(mut self, attempts: u32) -> Self {
        self.max_extraction_attempts = attempts.max(1);
        self
    }

    pub fn completion(&self) -> &dyn CompletionService {
        self.services.completion.as_ref()
    }

    pub fn catalog(&self) -> &dyn AvailabilityCatalog {
        self.services.catalog.as_ref()
    }

    pub fn prompts(&self) -> &dyn PromptRepository {
        self.services.prompts.as_ref()
    }

    pub fn source_filter(&self) -> Option<&[String]> {
        self.source_filter.as_deref()
    }
}
