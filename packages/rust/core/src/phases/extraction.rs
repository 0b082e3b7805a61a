//! Extraction: read candidate pages and turn them into normalized fields with
//! a lightweight structured-output model.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{debug, instrument, warn};
use url::Url;

use enricher_governor::RateGovernor;
use enricher_shared::text::{
    MAX_BULLETS, bullet_list, extract_address, extract_employee_count, extract_legal_name,
    extract_prefecture, sanitize_text, truncate_chars,
};
use enricher_shared::{
    ChatMessage, ChatModel, ChatRequest, EnrichmentRequest, PageFetcher, PipelineConfig,
    RateLimitKey, RecordFields, Signals,
};

use super::{
    Fatal, Phase, PhaseOutput, PhaseResult, PhaseRunner, PartialBundle, parse_json_object,
    permit, string_field, string_list,
};

const MAX_RESPONSE_TOKENS: u32 = 1500;

const SYSTEM_PROMPT: &str = "You extract company facts from Japanese corporate web pages. \
Reply with one JSON object only, using these keys when the pages support them: \
name_legal (string), address_lines (array of strings), employee_mentions (array of strings), \
service_heads (array of strings), product_heads (array of strings), \
news_headlines (array of strings), company_description (string). \
Omit keys you cannot fill. Never invent facts.";

/// The model's structured answer.
#[derive(Debug, Default, PartialEq)]
struct ExtractionPayload {
    name_legal: Option<String>,
    address_lines: Vec<String>,
    employee_mentions: Vec<String>,
    service_heads: Vec<String>,
    product_heads: Vec<String>,
    news_headlines: Vec<String>,
    company_description: Option<String>,
}

impl ExtractionPayload {
    fn from_map(map: &Map<String, Value>) -> Self {
        Self {
            name_legal: string_field(map, "name_legal"),
            address_lines: string_list(map, "address_lines"),
            employee_mentions: string_list(map, "employee_mentions"),
            service_heads: string_list(map, "service_heads"),
            product_heads: string_list(map, "product_heads"),
            news_headlines: string_list(map, "news_headlines"),
            company_description: string_field(map, "company_description"),
        }
    }

    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct ExtractionPhase {
    pages: Arc<dyn PageFetcher>,
    model: Arc<dyn ChatModel>,
    governor: Arc<RateGovernor>,
    config: Arc<PipelineConfig>,
}

impl ExtractionPhase {
    pub fn new(
        pages: Arc<dyn PageFetcher>,
        model: Arc<dyn ChatModel>,
        governor: Arc<RateGovernor>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            pages,
            model,
            governor,
            config,
        }
    }
}

#[async_trait]
impl PhaseRunner for ExtractionPhase {
    fn phase(&self) -> Phase {
        Phase::Extraction
    }

    #[instrument(skip_all, fields(entity_id = %request.entity_id, phase = "extraction"))]
    async fn run(
        &self,
        request: &EnrichmentRequest,
        prior: &PartialBundle,
    ) -> PhaseResult<PhaseOutput> {
        let mut targets: Vec<Url> = prior
            .candidate_pages
            .iter()
            .take(self.config.max_extraction_pages)
            .cloned()
            .collect();
        if targets.is_empty() {
            targets.extend(request.entity_id.url());
        }

        // Pages
        let mut fetched: Vec<(Url, String)> = Vec::new();
        let mut skipped: Vec<Value> = Vec::new();
        for page in targets.iter() {
            let key = RateLimitKey::for_url(page.as_str()).unwrap_or(RateLimitKey::Global);
            if let Err(wait) = permit(&self.governor, &key, self.config.max_permit_wait).await {
                return PhaseResult::RateLimited(wait);
            }
            match self.pages.fetch_text(page).await {
                Ok(text) if !text.trim().is_empty() => {
                    fetched.push((page.clone(), truncate_chars(&text, self.config.page_max_chars)));
                }
                Ok(_) => skipped.push(json!({"url": page.as_str(), "error": "empty page"})),
                Err(err) => {
                    warn!(url = %page, error = %err, "page skipped");
                    skipped.push(json!({"url": page.as_str(), "error": err.to_string()}));
                }
            }
        }

        // Model
        let messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(user_prompt(request, &targets, &fetched)),
        ];
        let key = request.origin_key();
        if let Err(wait) = permit(&self.governor, &key, self.config.max_permit_wait).await {
            return PhaseResult::RateLimited(wait);
        }
        let content = match self
            .model
            .complete(ChatRequest {
                messages,
                json_output: true,
                max_tokens: Some(MAX_RESPONSE_TOKENS),
            })
            .await
        {
            Ok(content) => content,
            Err(err) => return err.into(),
        };

        let Some(map) = parse_json_object(&content) else {
            return PhaseResult::FatalError(Fatal::Parse(
                "extraction response has no JSON object".into(),
            ));
        };
        let payload = ExtractionPayload::from_map(&map);
        if payload.is_empty() {
            return PhaseResult::FatalError(Fatal::Parse(
                "extraction response has no usable fields".into(),
            ));
        }

        let fields = normalize(request, &payload, &fetched);
        debug!(
            pages = fetched.len(),
            skipped = skipped.len(),
            services = payload.service_heads.len(),
            "extraction parsed"
        );

        let mut context = Vec::new();
        context.extend(payload.company_description.clone());
        if !payload.news_headlines.is_empty() {
            context.push(format!("最近のニュース: {}", payload.news_headlines.join(" / ")));
        }

        let mut signals = Signals::new();
        signals.insert("pages_fetched".into(), json!(fetched.len()));
        signals.insert("extraction_model".into(), json!(self.model.model_name()));
        if !skipped.is_empty() {
            signals.insert("skipped_pages".into(), Value::Array(skipped));
        }

        PhaseResult::Success {
            value: PhaseOutput {
                fields,
                candidate_pages: Vec::new(),
                context,
                signals,
            },
            evidence: fetched.iter().map(|(url, _)| url.to_string()).collect(),
        }
    }
}

fn user_prompt(request: &EnrichmentRequest, targets: &[Url], fetched: &[(Url, String)]) -> String {
    let mut prompt = format!(
        "会社名: {}\nWebサイト: {}\n業種: {}\n",
        request.name.trim(),
        request.entity_id,
        request.industry.trim()
    );
    if fetched.is_empty() {
        prompt.push_str("\nページ本文を取得できませんでした。以下のURLのみ参照可能です:\n");
        for url in targets {
            prompt.push_str(&format!("- {url}\n"));
        }
    } else {
        for (url, text) in fetched {
            prompt.push_str(&format!("\n### {url}\n{text}\n"));
        }
    }
    prompt
}

/// Map the payload onto record fields, falling back to the text extractors
/// over the fetched pages.
fn normalize(
    request: &EnrichmentRequest,
    payload: &ExtractionPayload,
    fetched: &[(Url, String)],
) -> RecordFields {
    let source_url = fetched
        .first()
        .map(|(url, _)| url.to_string())
        .unwrap_or_else(|| request.entity_id.to_string());

    let hq_address_raw = payload
        .address_lines
        .iter()
        .map(|line| sanitize_text(line))
        .find(|line| !line.is_empty())
        .or_else(|| fetched.iter().find_map(|(_, text)| extract_address(text)));

    let (employee_count, employee_count_source_url) = employee_count(payload, fetched)
        .map(|(count, url)| (Some(count), Some(url.unwrap_or_else(|| source_url.clone()))))
        .unwrap_or((None, None));

    RecordFields {
        name_legal: payload
            .name_legal
            .as_deref()
            .map(sanitize_text)
            .or_else(|| payload.company_description.as_deref().and_then(extract_legal_name)),
        prefecture_name: hq_address_raw
            .as_deref()
            .and_then(extract_prefecture)
            .map(String::from),
        hq_address_raw,
        services_text: bullet_list(&payload.service_heads, MAX_BULLETS),
        products_text: bullet_list(&payload.product_heads, MAX_BULLETS),
        employee_count,
        employee_count_source_url,
        ..RecordFields::default()
    }
}

/// Headcount from the model's mentions, else from the pages themselves.
/// Returns the page URL when the count came from a page.
fn employee_count(payload: &ExtractionPayload, fetched: &[(Url, String)]) -> Option<(u64, Option<String>)> {
    let mentions = payload.employee_mentions.join("\n");
    if let Some(count) = extract_employee_count(&mentions) {
        return Some((count, None));
    }
    if let Some(count) = payload.employee_mentions.iter().filter_map(|m| first_number(m)).max() {
        return Some((count, None));
    }
    fetched.iter().find_map(|(url, text)| {
        extract_employee_count(text).map(|count| (count, Some(url.to_string())))
    })
}

/// First run of digits in `text`, ignoring thousands separators.
fn first_number(text: &str) -> Option<u64> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || matches!(c, ',' | '，'))
        .filter(char::is_ascii_digit)
        .collect();
    digits.parse().ok().filter(|n| *n > 0)
}
