//! Phase runners and their typed result.
//!
//! A phase wraps one external interaction pattern. It never returns an error
//! past its [`PhaseResult`] boundary: every collaborator failure is mapped onto
//! one of the result variants before the orchestrator sees it.

pub mod discovery;
pub mod extraction;
pub mod synthesis;

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use enricher_governor::RateGovernor;
use enricher_shared::{EnrichmentRequest, ProviderError, RateLimitKey, RecordFields, Signals};

pub use discovery::DiscoveryPhase;
pub use extraction::ExtractionPhase;
pub use synthesis::SynthesisPhase;

/// Backoff hint used when a provider throttles without saying for how long.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// The three pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Discovery,
    Extraction,
    Synthesis,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Extraction => "extraction",
            Self::Synthesis => "synthesis",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures that retrying cannot fix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fatal {
    /// Model output had no usable structure or kept violating its shape.
    Parse(String),
    /// Provider credential rejected.
    Auth(String),
    /// Provider refused the request itself (4xx other than auth/quota).
    Rejected(String),
}

impl Fatal {
    /// Value of `signals.error_kind` for this failure.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse_error",
            Self::Auth(_) => "auth_error",
            Self::Rejected(_) => "rejected",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Parse(m) | Self::Auth(m) | Self::Rejected(m) => m,
        }
    }
}

/// Outcome of one phase attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseResult<T> {
    /// `evidence` lists the source URLs the value was derived from.
    Success { value: T, evidence: Vec<String> },
    NotFound,
    RateLimited(Duration),
    TransientError(String),
    FatalError(Fatal),
}

impl<T> From<ProviderError> for PhaseResult<T> {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::RateLimited { retry_after } => {
                Self::RateLimited(retry_after.unwrap_or(DEFAULT_RETRY_AFTER))
            }
            ProviderError::Transient(cause) => Self::TransientError(cause),
            // A garbled response envelope is a provider hiccup, not unusable content.
            ProviderError::Malformed(cause) => Self::TransientError(cause),
            ProviderError::Auth(cause) => Self::FatalError(Fatal::Auth(cause)),
            ProviderError::Rejected(cause) => Self::FatalError(Fatal::Rejected(cause)),
        }
    }
}

/// What a phase contributes to the draft.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseOutput {
    pub fields: RecordFields,
    /// Pages for Extraction to read, best first.
    pub candidate_pages: Vec<Url>,
    /// Free-text context for later phases (descriptions, headlines).
    pub context: Vec<String>,
    /// Diagnostics merged into the record's `signals`.
    pub signals: Signals,
}

/// Everything earlier phases produced, as seen by the next phase.
#[derive(Debug, Clone, Default)]
pub struct PartialBundle {
    pub fields: RecordFields,
    pub candidate_pages: Vec<Url>,
    pub context: Vec<String>,
}

#[async_trait]
pub trait PhaseRunner: Send + Sync {
    fn phase(&self) -> Phase;

    async fn run(
        &self,
        request: &EnrichmentRequest,
        prior: &PartialBundle,
    ) -> PhaseResult<PhaseOutput>;
}

/// Wait for a governor permit, giving up after `max_wait`.
///
/// `Err` carries the wait the governor still asked for.
pub(crate) async fn permit(
    governor: &RateGovernor,
    key: &RateLimitKey,
    max_wait: Duration,
) -> Result<(), Duration> {
    governor.acquire_within(key, max_wait).await.inspect_err(|wait| {
        debug!(
            origin = %key,
            retry_after_ms = wait.as_millis() as u64,
            "permit wait exceeds limit"
        );
    })
}

/// Parse the first JSON object in a model response.
///
/// Code fences and prose around the object are tolerated.
pub(crate) fn parse_json_object(content: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(&content[start..=end]) {
        Ok(serde_json::Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// String items under `key`, accepting an array or a single string.
pub(crate) fn string_list(map: &serde_json::Map<String, serde_json::Value>, key: &str) -> Vec<String> {
    match map.get(key) {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

/// Non-empty trimmed string under `key`.
pub(crate) fn string_field(map: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}
