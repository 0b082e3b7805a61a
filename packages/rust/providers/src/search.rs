//! Custom Search JSON API client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};

use enricher_shared::{
    ProviderError, ProviderResult, Result, SearchConfig, SearchHit, SearchProvider, resolve_secret,
};

use crate::http::{build_client, classify_status, classify_transport};

/// The API returns at most 10 results per request.
const MAX_RESULTS_PER_REQUEST: usize = 10;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    link: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: String,
}

/// Web search over a programmable search engine.
#[derive(Debug, Clone)]
pub struct CustomSearchClient {
    client: Client,
    endpoint: String,
    api_key: String,
    engine_id: String,
    language: String,
}

impl CustomSearchClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        engine_id: impl Into<String>,
        language: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            engine_id: engine_id.into(),
            language: language.into(),
        })
    }

    /// Build from config, reading credentials from the environment.
    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        Self::new(
            &config.endpoint,
            resolve_secret(&config.api_key_env)?,
            resolve_secret(&config.engine_id_env)?,
            &config.language,
            Duration::from_secs(config.timeout_secs),
        )
    }
}

#[async_trait]
impl SearchProvider for CustomSearchClient {
    #[instrument(skip_all, fields(query = %query))]
    async fn search(&self, query: &str, max_results: usize) -> ProviderResult<Vec<SearchHit>> {
        let num = max_results.clamp(1, MAX_RESULTS_PER_REQUEST).to_string();
        let mut params: Vec<(&str, &str)> = vec![
            ("key", self.api_key.as_str()),
            ("cx", self.engine_id.as_str()),
            ("q", query),
            ("num", num.as_str()),
        ];
        if !self.language.is_empty() {
            params.push(("lr", self.language.as_str()));
        }

        let response = self
            .client
            .get(&self.endpoint)
            .query(&params)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transient(format!("body read failed: {e}")))?;

        if !status.is_success() {
            return Err(classify_status(status, &headers, &body));
        }

        let parsed: SearchResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Malformed(format!("search response: {e}")))?;

        let hits: Vec<SearchHit> = parsed
            .items
            .into_iter()
            .filter(|item| !item.link.is_empty())
            .take(max_results)
            .map(|item| SearchHit {
                url: item.link,
                title: item.title,
                snippet: item.snippet,
            })
            .collect();

        debug!(hits = hits.len(), "search completed");
        Ok(hits)
    }
}
