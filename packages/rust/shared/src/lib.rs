//! Shared types, error model, configuration, and collaborator ports for the
//! enrichment engine.
//!
//! This crate is the foundation depended on by all other enricher crates.
//! It provides:
//! - [`EnricherError`] and [`ProviderError`], the unified error types
//! - Domain types ([`EnrichmentRequest`], [`EnrichmentRecord`], [`RateLimitKey`])
//! - Configuration ([`AppConfig`] and the runtime configs derived from it)
//! - Port traits implemented by providers and storage
//! - Japanese text extractors used as model fallbacks

pub mod config;
pub mod error;
pub mod ports;
pub mod text;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, GovernorConfig, ModelConfig, PipelineConfig, PipelineSection, QueueConfig,
    QueueSection, RateLimitsConfig, SearchConfig, ServerConfig, StorageConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from, render_config, resolve_secret,
    validate_api_keys,
};
pub use error::{EnricherError, ProviderError, Result};
pub use ports::{
    ChatMessage, ChatModel, ChatRequest, ChatRole, DeadLetterSink, PageFetcher, ProviderResult,
    RecordStore, SearchHit, SearchProvider, SourceCatalog,
};
pub use types::{
    EnrichmentRecord, EnrichmentRequest, EnrichmentStatus, EntityId, MAX_PAIN_HYPOTHESES,
    RateLimitKey, RecordFields, Signals,
};
