//! Environment-driven configuration

use crate::error::OrchestrationError;
use crate::Result;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Top-level configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub gemini: GeminiConfig,
    pub database: DatabaseConfig,
    pub catalog: CatalogConfig,
    pub workers: WorkerConfig,
    pub log_level: String,
}

/// Pipeline behaviour
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub engine_name: String,
    /// Conversation messages kept per run
    pub max_history_messages: usize,
    /// Attempts per clarifier phase
    pub max_extraction_attempts: u32,
    /// Overall deadline for the worker fan-out; `None` waits for every worker
    pub worker_timeout: Option<Duration>,
    /// How often the merge loop checks worker liveness while idle
    pub merge_poll_interval: Duration,
    pub merge_channel_capacity: usize,
    /// Caller-supplied subset of data sources
    pub source_filter: Option<Vec<String>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_name: "bank-research".to_string(),
            max_history_messages: 10,
            max_extraction_attempts: 3,
            worker_timeout: None,
            merge_poll_interval: Duration::from_millis(250),
            merge_channel_capacity: 64,
            source_filter: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
    pub cost_per_1k_input: f64,
    pub cost_per_1k_output: f64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gemini-2.0-flash".to_string(),
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            timeout: Duration::from_secs(60),
            cost_per_1k_input: 0.0,
            cost_per_1k_output: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    /// Postgres URL for the monitor sink; in-memory when unset
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// Financial API base URL; when set, sources are served over HTTP
    pub api_base_url: Option<String>,
    pub request_timeout: Duration,
}

impl AppConfig {
    /// Load configuration from environment variables (and `.env` if present)
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let defaults = EngineConfig::default();

        let engine = EngineConfig {
            engine_name: env::var("ENGINE_NAME").unwrap_or(defaults.engine_name),
            max_history_messages: parse_var("MAX_HISTORY_MESSAGES")?
                .unwrap_or(defaults.max_history_messages),
            max_extraction_attempts: parse_var("MAX_EXTRACTION_ATTEMPTS")?
                .unwrap_or(defaults.max_extraction_attempts),
            worker_timeout: parse_var::<u64>("WORKER_TIMEOUT_SECS")?.map(Duration::from_secs),
            merge_poll_interval: parse_var::<u64>("MERGE_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.merge_poll_interval),
            merge_channel_capacity: parse_var("MERGE_CHANNEL_CAPACITY")?
                .unwrap_or(defaults.merge_channel_capacity),
            source_filter: env::var("DATA_SOURCES").ok().and_then(|v| parse_list(&v)),
        };

        if engine.max_extraction_attempts == 0 {
            return Err(OrchestrationError::ConfigError(
                "MAX_EXTRACTION_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let gemini_defaults = GeminiConfig::default();
        let gemini = GeminiConfig {
            api_key: env::var("GEMINI_API_KEY").unwrap_or_default(),
            model: env::var("GEMINI_MODEL").unwrap_or(gemini_defaults.model),
            base_url: env::var("GEMINI_BASE_URL").unwrap_or(gemini_defaults.base_url),
            timeout: parse_var::<u64>("GEMINI_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(gemini_defaults.timeout),
            cost_per_1k_input: parse_var("GEMINI_COST_PER_1K_INPUT")?.unwrap_or(0.0),
            cost_per_1k_output: parse_var("GEMINI_COST_PER_1K_OUTPUT")?.unwrap_or(0.0),
        };

        let database = DatabaseConfig {
            url: env::var("POSTGRES_URL")
                .or_else(|_| env::var("DATABASE_URL"))
                .ok()
                .filter(|v| !v.trim().is_empty()),
            max_connections: parse_var("DATABASE_MAX_CONNECTIONS")?.unwrap_or(5),
        };

        let catalog = CatalogConfig {
            path: PathBuf::from(
                env::var("CATALOG_PATH").unwrap_or_else(|_| "./catalog.json".to_string()),
            ),
        };

        let workers = WorkerConfig {
            api_base_url: env::var("FINANCIAL_API_BASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            request_timeout: parse_var::<u64>("FINANCIAL_API_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(30)),
        };

        Ok(Self {
            engine,
            gemini,
            database,
            catalog,
            workers,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// Parse an optional variable; a present but malformed value is an error.
fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse::<T>().map(Some).map_err(|_| {
            OrchestrationError::ConfigError(format!("{} has invalid value '{}'", name, raw))
        }),
        _ => Ok(None),
    }
}

fn parse_list(raw: &str) -> Option<Vec<String>> {
    let items: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}
