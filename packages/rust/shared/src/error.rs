//! Error types for the enrichment engine.
//!
//! Library crates use [`EnricherError`] via `thiserror`.
//! The `enricher` binary wraps this with `color-eyre` for rich diagnostics.
//! Collaborator calls (search, models, page fetches) report the narrower
//! [`ProviderError`] so phase runners can classify failures without
//! inspecting message text.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all enrichment operations.
#[derive(Debug, thiserror::Error)]
pub enum EnricherError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error outside of a provider call.
    #[error("network error: {0}")]
    Network(String),

    /// Payload or model-output parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// A collaborator call failed.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Input validation error (malformed request, bad website, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Task queue error (closed channel, publish failure).
    #[error("queue error: {0}")]
    Queue(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, EnricherError>;

impl EnricherError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Normalized failure of a search, model, or page-fetch call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// HTTP 429 or a quota response. `retry_after` is the provider's hint, if any.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Network hiccup, timeout, 5xx, or an unreadable response body.
    #[error("transient failure: {0}")]
    Transient(String),

    /// HTTP 401/403 from the provider: the credential is unusable.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The provider refused the request (4xx other than auth/quota).
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The response arrived but its shape is unusable.
    #[error("malformed response: {0}")]
    Malformed(String),
}
