use bank_research_orchestrator::{
    agent::ResearchEngine,
    catalog::{AvailabilityCatalog, InMemoryCatalog},
    completion::{gemini::GeminiClient, CompletionService},
    config::AppConfig,
    context::Services,
    conversation::ChatMessage,
    monitor::{InMemoryMonitorSink, MonitorSink, PostgresMonitorSink},
    prompts::{BuiltinPrompts, PromptRepository},
    workers::{completion::CompletionWorker, http::HttpSourceWorker, WorkerRegistry},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;

    // RUST_LOG wins over LOG_LEVEL
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let query = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if query.trim().is_empty() {
        eprintln!("usage: orchestrator \"<question>\"");
        std::process::exit(2);
    }

    info!(engine = %config.engine.engine_name, "Bank research orchestrator starting");

    let catalog = InMemoryCatalog::from_json_file(&config.catalog.path)?.into_shared();
    let completion: Arc<dyn CompletionService> = Arc::new(GeminiClient::new(config.gemini.clone())?);
    let prompts: Arc<dyn PromptRepository> = Arc::new(BuiltinPrompts::new());

    let sink: Arc<dyn MonitorSink> = match &config.database.url {
        Some(url) => Arc::new(PostgresMonitorSink::connect_lazy(url, config.database.max_connections)?),
        None => {
            warn!("No database configured, monitor entries stay in memory");
            Arc::new(InMemoryMonitorSink::new())
        }
    };

    let registry = build_registry(&config, catalog.as_ref(), &completion, &prompts).await?;
    info!(workers = registry.len(), "Workers registered");

    let services = Arc::new(Services::new(completion, catalog, prompts));
    let engine = ResearchEngine::new(config.engine.clone(), services, sink, Arc::new(registry));

    let (tx, mut rx) = mpsc::channel(256);
    let printer = async {
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "Could not serialize output message"),
            }
        }
    };

    let (result, ()) = tokio::join!(engine.run(vec![ChatMessage::user(query)], tx), printer);

    match result {
        Ok(summary) => {
            info!(
                run_id = %summary.run_id,
                outcome = ?summary.outcome,
                sources = ?summary.sources,
                total_tokens = summary.usage.total_tokens(),
                "Run complete"
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Run failed: {}", e);
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}

/// One worker per catalogued source: HTTP when a financial API is configured,
/// otherwise model-backed.
async fn build_registry(
    config: &AppConfig,
    catalog: &dyn AvailabilityCatalog,
    completion: &Arc<dyn CompletionService>,
    prompts: &Arc<dyn PromptRepository>,
) -> bank_research_orchestrator::Result<WorkerRegistry> {
    let mut registry = WorkerRegistry::new();

    for (source_id, description) in catalog.source_descriptions().await? {
        match &config.workers.api_base_url {
            Some(base_url) => registry.register(Arc::new(HttpSourceWorker::new(
                &source_id,
                &description,
                base_url,
                config.workers.request_timeout,
            )?)),
            None => registry.register(Arc::new(CompletionWorker::new(
                &source_id,
                &description,
                completion.clone(),
                prompts.clone(),
            ))),
        }
    }

    Ok(registry)
}
