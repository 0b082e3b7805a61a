//! Collaborator interfaces used by the pipeline.
//!
//! Phase runners and the orchestrator depend only on these traits. HTTP
//! implementations live in `enricher-providers`, the libSQL store in
//! `enricher-storage`, and tests substitute in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ProviderError, Result};
use crate::types::{EnrichmentRecord, EnrichmentRequest, EntityId};

/// Result alias for collaborator calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

/// One ranked web search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub snippet: String,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Run one query, returning at most `max_results` hits in rank order.
    async fn search(&self, query: &str, max_results: usize) -> ProviderResult<Vec<SearchHit>>;
}

// ---------------------------------------------------------------------------
// Chat models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A single chat completion request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Ask the model for a JSON object response.
    pub json_output: bool,
    pub max_tokens: Option<u32>,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Return the assistant's text for `request`.
    async fn complete(&self, request: ChatRequest) -> ProviderResult<String>;

    fn model_name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Page fetching
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch a page and return its visible text.
    async fn fetch_text(&self, url: &Url) -> ProviderResult<String>;
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Store of enrichment records keyed by entity id.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_record(&self, entity_id: &EntityId) -> Result<Option<EnrichmentRecord>>;

    /// Insert or fully replace the record.
    async fn upsert_record(&self, record: &EnrichmentRecord) -> Result<()>;

    /// Insert the record, or update only `status`, `signals`, and
    /// `last_crawled_at` of an existing one.
    async fn upsert_status(&self, record: &EnrichmentRecord) -> Result<()>;
}

/// Source of entities awaiting enrichment.
#[async_trait]
pub trait SourceCatalog: Send + Sync {
    /// Entities without an `ok` record, optionally filtered by industry.
    async fn pending_sources(
        &self,
        industry: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EnrichmentRequest>>;
}

/// Sink for deliveries the queue gave up on.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Persist a delivery that will not be retried. `entity_id` is absent
    /// when the payload could not be decoded.
    async fn record_dead_letter(
        &self,
        entity_id: Option<&EntityId>,
        payload: &str,
        reason: &str,
        attempts: u32,
    ) -> Result<()>;
}
