//! Page fetcher: downloads a page and reduces it to visible text.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use scraper::{Html, Node};
use tracing::{debug, instrument, warn};
use url::Url;

use enricher_shared::text::truncate_chars;
use enricher_shared::{PageFetcher, ProviderError, ProviderResult, Result};

use crate::http::{build_client, classify_status, classify_transport, is_ssrf_target};

/// Elements whose text is never visible.
const HIDDEN_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "svg", "head"];

/// Fetches public web pages for the extraction phase.
#[derive(Debug, Clone)]
pub struct HttpPageFetcher {
    client: Client,
    max_chars: usize,
    /// Allow localhost/private IPs (for tests with mock servers).
    allow_private: bool,
}

impl HttpPageFetcher {
    pub fn new(timeout: Duration, max_chars: usize) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            max_chars,
            allow_private: false,
        })
    }

    /// Allow fetching localhost/private IPs (for integration tests).
    #[cfg(test)]
    pub fn allow_localhost(mut self) -> Self {
        self.allow_private = true;
        self
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    #[instrument(skip_all, fields(url = %url))]
    async fn fetch_text(&self, url: &Url) -> ProviderResult<String> {
        if !self.allow_private && is_ssrf_target(url) {
            warn!("SSRF protection: blocked");
            return Err(ProviderError::Rejected(format!("blocked target: {url}")));
        }

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transient(format!("{url}: body read failed: {e}")))?;

        if !status.is_success() {
            return Err(classify_status(status, &headers, &body));
        }

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .to_ascii_lowercase();

        let text = if content_type.contains("html") {
            html_to_text(&body)
        } else if content_type.starts_with("text/") {
            body
        } else {
            return Err(ProviderError::Rejected(format!(
                "{url}: unsupported content type {content_type}"
            )));
        };

        let text = truncate_chars(&text, self.max_chars);
        debug!(chars = text.chars().count(), "page fetched");
        Ok(text)
    }
}

/// Visible text of an HTML document, one text run per line.
pub fn html_to_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    let mut lines: Vec<&str> = Vec::new();

    for node in doc.root_element().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|el| HIDDEN_ELEMENTS.contains(&el.name()))
        });
        if hidden {
            continue;
        }
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed);
        }
    }

    lines.join("\n")
}
