//! Application configuration for the enrichment engine.
//!
//! User config lives at `~/.enricher/enricher.toml`.
//! CLI flags override config file values, which override defaults.
//! Credentials are never stored in the file: each provider section names the
//! environment variable that holds its key.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EnricherError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "enricher.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".enricher";

// ---------------------------------------------------------------------------
// Config structs (matching enricher.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,

    #[serde(default)]
    pub pipeline: PipelineSection,

    #[serde(default)]
    pub queue: QueueSection,

    #[serde(default)]
    pub search: SearchConfig,

    /// Model used by the extraction phase.
    #[serde(default = "default_extraction_model")]
    pub extraction_model: ModelConfig,

    /// Model used by the synthesis phase.
    #[serde(default = "default_synthesis_model")]
    pub synthesis_model: ModelConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rate_limits: RateLimitsConfig::default(),
            pipeline: PipelineSection::default(),
            queue: QueueSection::default(),
            search: SearchConfig::default(),
            extraction_model: default_extraction_model(),
            synthesis_model: default_synthesis_model(),
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// `[rate_limits]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    /// Sustained permits per second for a single origin.
    #[serde(default = "default_origin_rps")]
    pub origin_rps: f64,

    /// Bucket capacity per origin. Values above 1 allow short bursts that
    /// exceed `origin_rps` within a one-second window.
    #[serde(default = "default_burst")]
    pub origin_burst: u32,

    /// Sustained permits per second across the whole process.
    #[serde(default = "default_global_rps")]
    pub global_rps: f64,

    #[serde(default = "default_burst")]
    pub global_burst: u32,

    /// Origin buckets kept in memory before least-recently-used eviction.
    #[serde(default = "default_max_tracked_origins")]
    pub max_tracked_origins: usize,

    /// Idle origin buckets older than this are swept.
    #[serde(default = "default_origin_idle_secs")]
    pub origin_idle_secs: u64,

    /// Longest a phase will sleep for a permit before reporting `rate_limited`.
    #[serde(default = "default_max_permit_wait_secs")]
    pub max_permit_wait_secs: u64,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            origin_rps: default_origin_rps(),
            origin_burst: default_burst(),
            global_rps: default_global_rps(),
            global_burst: default_burst(),
            max_tracked_origins: default_max_tracked_origins(),
            origin_idle_secs: default_origin_idle_secs(),
            max_permit_wait_secs: default_max_permit_wait_secs(),
        }
    }
}

fn default_origin_rps() -> f64 {
    1.0
}
fn default_global_rps() -> f64 {
    100.0
}
fn default_burst() -> u32 {
    1
}
fn default_max_tracked_origins() -> usize {
    10_000
}
fn default_origin_idle_secs() -> u64 {
    300
}
fn default_max_permit_wait_secs() -> u64 {
    30
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Discovery queries issued per entity (clamped to 1..=3).
    #[serde(default = "default_max_search_queries")]
    pub max_search_queries: usize,

    #[serde(default = "default_results_per_query")]
    pub results_per_query: usize,

    /// Pages handed to the extraction phase.
    #[serde(default = "default_max_extraction_pages")]
    pub max_extraction_pages: usize,

    /// Characters of visible page text kept per fetched page.
    #[serde(default = "default_page_max_chars")]
    pub page_max_chars: usize,

    /// Attempts per phase before the orchestrator gives up.
    #[serde(default = "default_max_phase_attempts")]
    pub max_phase_attempts: u32,

    /// Delay before retry N (1-based), in seconds. The last entry repeats.
    #[serde(default = "default_backoff_schedule_secs")]
    pub backoff_schedule_secs: Vec<u64>,

    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,

    /// Wall-clock budget for a single task invocation.
    #[serde(default = "default_invocation_budget_secs")]
    pub invocation_budget_secs: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_search_queries: default_max_search_queries(),
            results_per_query: default_results_per_query(),
            max_extraction_pages: default_max_extraction_pages(),
            page_max_chars: default_page_max_chars(),
            max_phase_attempts: default_max_phase_attempts(),
            backoff_schedule_secs: default_backoff_schedule_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
            invocation_budget_secs: default_invocation_budget_secs(),
        }
    }
}

fn default_max_search_queries() -> usize {
    2
}
fn default_results_per_query() -> usize {
    5
}
fn default_max_extraction_pages() -> usize {
    3
}
fn default_page_max_chars() -> usize {
    50_000
}
fn default_max_phase_attempts() -> u32 {
    5
}
fn default_backoff_schedule_secs() -> Vec<u64> {
    vec![60, 300, 900, 3600]
}
fn default_backoff_cap_secs() -> u64 {
    3600
}
fn default_invocation_budget_secs() -> u64 {
    540
}

/// `[queue]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    /// Deliveries before a task is dead-lettered.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,

    #[serde(default = "default_min_backoff_secs")]
    pub min_backoff_secs: u64,

    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Dispatcher stops publishing while this many tasks are in flight.
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: usize,

    /// Concurrent consumer workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_deliveries: default_max_deliveries(),
            min_backoff_secs: default_min_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            max_outstanding: default_max_outstanding(),
            workers: default_workers(),
        }
    }
}

fn default_max_deliveries() -> u32 {
    5
}
fn default_min_backoff_secs() -> u64 {
    10
}
fn default_max_backoff_secs() -> u64 {
    300
}
fn default_max_outstanding() -> usize {
    500
}
fn default_workers() -> usize {
    8
}

/// `[search]` section (Custom Search JSON API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,

    /// Env var holding the API key.
    #[serde(default = "default_search_key_env")]
    pub api_key_env: String,

    /// Env var holding the search engine id (`cx`).
    #[serde(default = "default_search_engine_env")]
    pub engine_id_env: String,

    /// Language restriction passed as `lr`.
    #[serde(default = "default_search_language")]
    pub language: String,

    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: default_search_endpoint(),
            api_key_env: default_search_key_env(),
            engine_id_env: default_search_engine_env(),
            language: default_search_language(),
            timeout_secs: default_search_timeout(),
        }
    }
}

fn default_search_endpoint() -> String {
    "https://www.googleapis.com/customsearch/v1".into()
}
fn default_search_key_env() -> String {
    "GOOGLE_SEARCH_API_KEY".into()
}
fn default_search_engine_env() -> String {
    "GOOGLE_CSE_ID".into()
}
fn default_search_language() -> String {
    "lang_ja".into()
}
fn default_search_timeout() -> u64 {
    30
}

/// `[extraction_model]` / `[synthesis_model]` sections (OpenAI-compatible chat API).
///
/// A section that is present must name `base_url`, `model`, and `api_key_env`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Send `response_format: json_object` when a phase asks for JSON.
    #[serde(default)]
    pub json_mode: bool,
}

fn default_extraction_model() -> ModelConfig {
    ModelConfig {
        base_url: "https://api.perplexity.ai".into(),
        model: "sonar".into(),
        api_key_env: "PPLX_API_KEY".into(),
        timeout_secs: default_model_timeout(),
        temperature: default_temperature(),
        json_mode: false,
    }
}
fn default_synthesis_model() -> ModelConfig {
    ModelConfig {
        base_url: "https://api.openai.com/v1".into(),
        model: "gpt-5-mini".into(),
        api_key_env: "OPENAI_API_KEY".into(),
        timeout_secs: default_model_timeout(),
        temperature: default_temperature(),
        json_mode: true,
    }
}
fn default_model_timeout() -> u64 {
    60
}
fn default_temperature() -> f32 {
    0.2
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".into()
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the libSQL database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "var/enricher.db".into()
}

impl AppConfig {
    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limits;
        if !(rl.origin_rps > 0.0) || !(rl.global_rps > 0.0) {
            return Err(EnricherError::config("rate_limits: rps must be positive"));
        }
        if rl.origin_burst == 0 || rl.global_burst == 0 {
            return Err(EnricherError::config("rate_limits: burst must be at least 1"));
        }
        if rl.max_tracked_origins == 0 {
            return Err(EnricherError::config(
                "rate_limits: max_tracked_origins must be at least 1",
            ));
        }
        if self.pipeline.backoff_schedule_secs.is_empty() {
            return Err(EnricherError::config(
                "pipeline: backoff_schedule_secs must not be empty",
            ));
        }
        if self.pipeline.max_phase_attempts == 0 {
            return Err(EnricherError::config(
                "pipeline: max_phase_attempts must be at least 1",
            ));
        }
        if self.queue.min_backoff_secs > self.queue.max_backoff_secs {
            return Err(EnricherError::config(
                "queue: min_backoff_secs exceeds max_backoff_secs",
            ));
        }
        if self.queue.workers == 0 || self.queue.max_outstanding == 0 {
            return Err(EnricherError::config(
                "queue: workers and max_outstanding must be at least 1",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Runtime configs (derived from AppConfig)
// ---------------------------------------------------------------------------

/// Runtime rate governor configuration.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub origin_rps: f64,
    pub origin_burst: u32,
    pub global_rps: f64,
    pub global_burst: u32,
    pub max_tracked_origins: usize,
    pub origin_idle: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for GovernorConfig {
    fn from(config: &AppConfig) -> Self {
        let rl = &config.rate_limits;
        Self {
            origin_rps: rl.origin_rps,
            origin_burst: rl.origin_burst,
            global_rps: rl.global_rps,
            global_burst: rl.global_burst,
            max_tracked_origins: rl.max_tracked_origins,
            origin_idle: Duration::from_secs(rl.origin_idle_secs),
        }
    }
}

/// Runtime configuration for phase runners and the orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_search_queries: usize,
    pub results_per_query: usize,
    pub max_extraction_pages: usize,
    pub page_max_chars: usize,
    pub max_phase_attempts: u32,
    pub backoff_schedule: Vec<Duration>,
    pub backoff_cap: Duration,
    pub invocation_budget: Duration,
    pub max_permit_wait: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        let p = &config.pipeline;
        Self {
            max_search_queries: p.max_search_queries.clamp(1, 3),
            results_per_query: p.results_per_query.max(1),
            max_extraction_pages: p.max_extraction_pages,
            page_max_chars: p.page_max_chars,
            max_phase_attempts: p.max_phase_attempts,
            backoff_schedule: p
                .backoff_schedule_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            backoff_cap: Duration::from_secs(p.backoff_cap_secs),
            invocation_budget: Duration::from_secs(p.invocation_budget_secs),
            max_permit_wait: Duration::from_secs(config.rate_limits.max_permit_wait_secs),
        }
    }
}

/// Runtime task queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_deliveries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub max_outstanding: usize,
    pub workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for QueueConfig {
    fn from(config: &AppConfig) -> Self {
        let q = &config.queue;
        Self {
            max_deliveries: q.max_deliveries.max(1),
            min_backoff: Duration::from_secs(q.min_backoff_secs),
            max_backoff: Duration::from_secs(q.max_backoff_secs),
            max_outstanding: q.max_outstanding.max(1),
            workers: q.workers.max(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.enricher/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| EnricherError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.enricher/enricher.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| EnricherError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| EnricherError::config(format!("failed to parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| EnricherError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let content = render_config(&AppConfig::default())?;

    std::fs::write(&path, content).map_err(|e| EnricherError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Render a config as pretty TOML.
pub fn render_config(config: &AppConfig) -> Result<String> {
    toml::to_string_pretty(config).map_err(|e| EnricherError::config(e.to_string()))
}

/// Read a credential from the named env var.
pub fn resolve_secret(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        _ => Err(EnricherError::config(format!(
            "credential not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Check that every provider credential env var is set and non-empty.
pub fn validate_api_keys(config: &AppConfig) -> Result<()> {
    let required = [
        config.search.api_key_env.as_str(),
        config.search.engine_id_env.as_str(),
        config.extraction_model.api_key_env.as_str(),
        config.synthesis_model.api_key_env.as_str(),
    ];

    let missing: Vec<&str> = required
        .into_iter()
        .filter(|name| resolve_secret(name).is_err())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(EnricherError::config(format!(
            "API keys not found. Set the following environment variables: {}",
            missing.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = render_config(&config).expect("serialize default config");
        assert!(toml_str.contains("origin_rps"));
        assert!(toml_str.contains("GOOGLE_SEARCH_API_KEY"));
        assert!(toml_str.contains("PPLX_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let toml_str = render_config(&AppConfig::default()).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.rate_limits.global_rps, 100.0);
        assert_eq!(parsed.pipeline.backoff_schedule_secs, vec![60, 300, 900, 3600]);
        assert_eq!(parsed.synthesis_model.model, "gpt-5-mini");
        parsed.validate().expect("defaults are valid");
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let toml_str = r#"
[rate_limits]
origin_rps = 2.0

[queue]
workers = 2
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.rate_limits.origin_rps, 2.0);
        assert_eq!(config.rate_limits.global_rps, 100.0);
        assert_eq!(config.queue.workers, 2);
        assert_eq!(config.queue.max_deliveries, 5);
        assert_eq!(config.extraction_model.model, "sonar");
    }

    #[test]
    fn validate_rejects_zero_rps() {
        let mut config = AppConfig::default();
        config.rate_limits.origin_rps = 0.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rps must be positive"));
    }

    #[test]
    fn pipeline_config_clamps_queries() {
        let mut app = AppConfig::default();
        app.pipeline.max_search_queries = 9;
        let pipeline = PipelineConfig::from(&app);
        assert_eq!(pipeline.max_search_queries, 3);
        assert_eq!(pipeline.backoff_schedule[0], Duration::from_secs(60));
        assert_eq!(pipeline.invocation_budget, Duration::from_secs(540));
        assert_eq!(pipeline.max_permit_wait, Duration::from_secs(30));

        app.pipeline.max_search_queries = 0;
        assert_eq!(PipelineConfig::from(&app).max_search_queries, 1);
    }

    #[test]
    fn runtime_configs_from_app_config() {
        let app = AppConfig::default();
        let gov = GovernorConfig::from(&app);
        assert_eq!(gov.origin_burst, 1);
        assert_eq!(gov.origin_idle, Duration::from_secs(300));

        let queue = QueueConfig::from(&app);
        assert_eq!(queue.min_backoff, Duration::from_secs(10));
        assert_eq!(queue.max_backoff, Duration::from_secs(300));
        assert_eq!(queue.max_outstanding, 500);
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Unique env var names so the host environment cannot satisfy them
        config.search.api_key_env = "ENRICHER_TEST_NONEXISTENT_SEARCH_KEY".into();
        config.search.engine_id_env = "ENRICHER_TEST_NONEXISTENT_CSE".into();
        config.extraction_model.api_key_env = "ENRICHER_TEST_NONEXISTENT_PPLX".into();
        config.synthesis_model.api_key_env = "ENRICHER_TEST_NONEXISTENT_OPENAI".into();
        let err = validate_api_keys(&config).unwrap_err().to_string();
        assert!(err.contains("API keys not found"));
        assert!(err.contains("ENRICHER_TEST_NONEXISTENT_CSE"));
    }
}
