//! Core domain types for entity enrichment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{EnricherError, Result};

/// Diagnostic map persisted alongside every record.
pub type Signals = serde_json::Map<String, serde_json::Value>;

/// Maximum number of pain hypotheses a persisted record may carry.
pub const MAX_PAIN_HYPOTHESES: usize = 5;

/// Second-level labels under which registrations happen one level deeper.
const PUBLIC_SECOND_LEVELS: &[&str] = &[
    "co.jp", "or.jp", "ne.jp", "ac.jp", "go.jp", "ed.jp", "gr.jp", "lg.jp", "co.uk", "org.uk",
    "ac.uk", "com.au", "net.au", "org.au", "co.kr", "com.cn", "com.tw", "com.sg", "co.nz",
];

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// Stable entity key: the normalized website URL.
///
/// Normalization adds `https://` when no scheme is present, lower-cases the
/// whole string, and drops a trailing `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    /// Normalize a website into an entity key.
    pub fn from_website(website: &str) -> Result<Self> {
        let trimmed = website.trim();
        if trimmed.is_empty() {
            return Err(EnricherError::validation("website is empty"));
        }

        let lowered = trimmed.to_lowercase();
        let mut normalized = if lowered.starts_with("http://") || lowered.starts_with("https://") {
            lowered
        } else {
            format!("https://{lowered}")
        };
        while normalized.ends_with('/') {
            normalized.pop();
        }

        let url = Url::parse(&normalized)
            .map_err(|e| EnricherError::validation(format!("invalid website '{website}': {e}")))?;
        match url.host_str() {
            Some(host) if host.contains('.') => {}
            _ => {
                return Err(EnricherError::validation(format!(
                    "website '{website}' has no dotted host"
                )));
            }
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parsed URL form of the key.
    pub fn url(&self) -> Option<Url> {
        Url::parse(&self.0).ok()
    }

    /// Host of the website without a leading `www.`.
    pub fn domain(&self) -> String {
        self.url()
            .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
            .unwrap_or_default()
    }
}

impl TryFrom<String> for EntityId {
    type Error = EnricherError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_website(&value)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// EnrichmentRequest
// ---------------------------------------------------------------------------

/// Immutable input for one entity's enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRequest {
    /// Normalized website. Accepts `website` on the wire as well.
    #[serde(alias = "website")]
    pub entity_id: EntityId,
    pub name: String,
    pub industry: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inquiry_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl EnrichmentRequest {
    /// Check name and industry constraints. The website is already validated
    /// by [`EntityId`] construction.
    pub fn validate(&self) -> Result<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(EnricherError::validation("name is empty"));
        }
        if name.chars().count() > 200 {
            return Err(EnricherError::validation("name exceeds 200 characters"));
        }
        if name
            .chars()
            .any(|c| matches!(c, '<' | '>' | '"' | '&' | '\n' | '\r' | '\t'))
        {
            return Err(EnricherError::validation(
                "name contains markup or control characters",
            ));
        }

        let industry = self.industry.trim();
        if industry.is_empty() {
            return Err(EnricherError::validation("industry is empty"));
        }
        if industry.chars().count() > 100 {
            return Err(EnricherError::validation("industry exceeds 100 characters"));
        }
        Ok(())
    }

    /// Rate-limit key for calls made on behalf of this entity.
    pub fn origin_key(&self) -> RateLimitKey {
        RateLimitKey::for_url(self.entity_id.as_str()).unwrap_or(RateLimitKey::Global)
    }
}

// ---------------------------------------------------------------------------
// EnrichmentStatus
// ---------------------------------------------------------------------------

/// Terminal status of one orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Ok,
    NotFound,
    Timeout,
    RateLimited,
    ParseError,
}

impl EnrichmentStatus {
    pub const ALL: [EnrichmentStatus; 5] = [
        Self::Ok,
        Self::NotFound,
        Self::Timeout,
        Self::RateLimited,
        Self::ParseError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::NotFound => "not_found",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::ParseError => "parse_error",
        }
    }
}

impl std::fmt::Display for EnrichmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EnrichmentStatus {
    type Err = EnricherError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| EnricherError::parse(format!("unknown status '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// RecordFields / EnrichmentRecord
// ---------------------------------------------------------------------------

/// The enrichable attributes of a record. Every phase produces a partial set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_legal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hq_address_raw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefecture_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overview_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub products_text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pain_hypotheses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personalization_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employee_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employee_count_source_url: Option<String>,
}

impl RecordFields {
    /// True when no field carries a value.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// The persisted enrichment output, keyed by `entity_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub entity_id: EntityId,
    #[serde(flatten)]
    pub fields: RecordFields,
    pub last_crawled_at: DateTime<Utc>,
    pub status: EnrichmentStatus,
    #[serde(default)]
    pub signals: Signals,
}

// ---------------------------------------------------------------------------
// RateLimitKey
// ---------------------------------------------------------------------------

/// Scope a rate-limit budget applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RateLimitKey {
    /// Registrable domain of the URL being called.
    Origin(String),
    /// The process-wide budget.
    Global,
}

impl RateLimitKey {
    /// Derive the origin key (registrable domain) for a URL or bare host.
    pub fn for_url(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("https://{trimmed}")
        };
        let url = Url::parse(&with_scheme).ok()?;
        let host = url.host_str()?.to_lowercase();
        Some(Self::Origin(registrable_domain(&host)))
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Origin(origin) => f.write_str(origin),
            Self::Global => f.write_str("GLOBAL"),
        }
    }
}

/// Reduce a host to its registrable domain.
fn registrable_domain(host: &str) -> String {
    let host = host.trim_end_matches('.');
    if host.parse::<std::net::IpAddr>().is_ok() {
        return host.to_string();
    }

    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() <= 2 {
        return labels.join(".");
    }

    let last_two = labels[labels.len() - 2..].join(".");
    let keep = if PUBLIC_SECOND_LEVELS.contains(&last_two.as_str()) {
        3
    } else {
        2
    };
    labels[labels.len() - keep..].join(".")
}
