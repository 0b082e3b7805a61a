//! OpenAI-compatible chat completions client.
//!
//! Both the extraction model (Perplexity) and the synthesis model (OpenAI)
//! speak this protocol: `POST {base_url}/chat/completions` with bearer auth.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use enricher_shared::{
    ChatMessage, ChatModel, ChatRequest, ModelConfig, ProviderError, ProviderResult, Result,
    resolve_secret,
};

use crate::http::{build_client, classify_status, classify_transport};

#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat model reached over an OpenAI-compatible HTTP API.
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    json_mode: bool,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.2,
            json_mode: false,
        })
    }

    /// Build from a model section, reading the key from the environment.
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let mut client = Self::new(
            &config.base_url,
            resolve_secret(&config.api_key_env)?,
            &config.model,
            Duration::from_secs(config.timeout_secs),
        )?;
        client.temperature = config.temperature;
        client.json_mode = config.json_mode;
        Ok(client)
    }

    pub fn with_json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    #[instrument(skip_all, fields(model = %self.model, messages = request.messages.len()))]
    async fn complete(&self, request: ChatRequest) -> ProviderResult<String> {
        let body = CompletionBody {
            model: &self.model,
            messages: &request.messages,
            temperature: self.temperature,
            max_tokens: request.max_tokens,
            response_format: (request.json_output && self.json_mode).then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Transient(format!("body read failed: {e}")))?;

        if !status.is_success() {
            return Err(classify_status(status, &headers, &text));
        }

        let parsed: CompletionResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Malformed(format!("completion response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ProviderError::Malformed("completion has no content".into()))?;

        debug!(chars = content.len(), "completion received");
        Ok(content)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
