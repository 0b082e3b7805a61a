//! HTTP implementations of the collaborator ports: web search, chat models,
//! and page fetching.
//!
//! Every client maps failures onto [`enricher_shared::ProviderError`] so phase
//! runners can classify them. Rate limiting is not done here; callers obtain
//! permits from the governor first.

pub mod chat;
pub mod fetch;
mod http;
pub mod search;

pub use chat::OpenAiCompatClient;
pub use fetch::{HttpPageFetcher, html_to_text};
pub use search::CustomSearchClient;
