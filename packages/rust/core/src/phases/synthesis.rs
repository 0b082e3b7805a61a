//! Synthesis: write the overview, pain hypotheses, and personalization notes
//! from everything gathered so far, with shape validation and one corrective
//! re-request.

use std::ops::RangeInclusive;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{instrument, warn};

use enricher_governor::RateGovernor;
use enricher_shared::text::sanitize_text;
use enricher_shared::{
    ChatMessage, ChatModel, ChatRequest, EnrichmentRequest, MAX_PAIN_HYPOTHESES, PipelineConfig,
    RecordFields, Signals,
};

use super::{
    Fatal, Phase, PhaseOutput, PhaseResult, PhaseRunner, PartialBundle, parse_json_object,
    permit, string_field, string_list,
};

const OVERVIEW_CHARS: RangeInclusive<usize> = 200..=400;
const HYPOTHESIS_CHARS: RangeInclusive<usize> = 80..=120;
const MIN_HYPOTHESES: usize = 3;
const MAX_NOTES_CHARS: usize = 500;
/// The first request plus one corrective re-request.
const MAX_REQUESTS: u32 = 2;
const MAX_RESPONSE_TOKENS: u32 = 2000;

const SYSTEM_PROMPT: &str = "あなたは法人営業のリサーチ担当です。与えられた企業情報だけを根拠に、\
次のキーを持つJSONオブジェクトを1つだけ返してください。\
overview: 事業概要（200〜400文字）。\
pain_hypotheses: 想定される経営・業務上の課題仮説の配列（3〜5件、各80〜120文字）。\
personalization_notes: 営業メール冒頭に使える具体的な一言メモ（500文字以内）。\
推測で事実を作らないでください。";

/// Validated synthesis output.
#[derive(Debug, Clone, PartialEq)]
struct Synthesized {
    overview: String,
    hypotheses: Vec<String>,
    notes: String,
    truncated_from: Option<usize>,
}

pub struct SynthesisPhase {
    model: Arc<dyn ChatModel>,
    governor: Arc<RateGovernor>,
    config: Arc<PipelineConfig>,
}

impl SynthesisPhase {
    pub fn new(
        model: Arc<dyn ChatModel>,
        governor: Arc<RateGovernor>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            model,
            governor,
            config,
        }
    }
}

#[async_trait]
impl PhaseRunner for SynthesisPhase {
    fn phase(&self) -> Phase {
        Phase::Synthesis
    }

    #[instrument(skip_all, fields(entity_id = %request.entity_id, phase = "synthesis"))]
    async fn run(
        &self,
        request: &EnrichmentRequest,
        prior: &PartialBundle,
    ) -> PhaseResult<PhaseOutput> {
        let key = request.origin_key();
        let mut messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(user_prompt(request, prior)),
        ];

        let mut requests = 0;
        loop {
            requests += 1;
            if let Err(wait) = permit(&self.governor, &key, self.config.max_permit_wait).await {
                return PhaseResult::RateLimited(wait);
            }
            let content = match self
                .model
                .complete(ChatRequest {
                    messages: messages.clone(),
                    json_output: true,
                    max_tokens: Some(MAX_RESPONSE_TOKENS),
                })
                .await
            {
                Ok(content) => content,
                Err(err) => return err.into(),
            };

            match validate(&content) {
                Ok(shaped) => return success(shaped, requests, self.model.model_name()),
                Err(violations) if requests >= MAX_REQUESTS => {
                    return PhaseResult::FatalError(Fatal::Parse(format!(
                        "synthesis output violates shape: {}",
                        violations.join("; ")
                    )));
                }
                Err(violations) => {
                    warn!(violations = violations.len(), "synthesis shape violated, re-requesting");
                    messages.push(ChatMessage::assistant(content));
                    messages.push(ChatMessage::user(corrective_prompt(&violations)));
                }
            }
        }
    }
}

fn success(shaped: Synthesized, requests: u32, model: &str) -> PhaseResult<PhaseOutput> {
    let mut signals = Signals::new();
    signals.insert("synthesis_requests".into(), json!(requests));
    signals.insert("synthesis_model".into(), json!(model));
    if let Some(from) = shaped.truncated_from {
        signals.insert("hypotheses_truncated_from".into(), json!(from));
    }

    PhaseResult::Success {
        value: PhaseOutput {
            fields: RecordFields {
                overview_text: Some(shaped.overview),
                pain_hypotheses: shaped.hypotheses,
                personalization_notes: Some(shaped.notes),
                ..RecordFields::default()
            },
            signals,
            ..PhaseOutput::default()
        },
        evidence: Vec::new(),
    }
}

fn user_prompt(request: &EnrichmentRequest, prior: &PartialBundle) -> String {
    let f = &prior.fields;
    let mut lines = vec![
        format!("会社名: {}", request.name.trim()),
        format!("Webサイト: {}", request.entity_id),
        format!("業種: {}", request.industry.trim()),
    ];
    let mut push = |label: &str, value: Option<&str>| {
        if let Some(v) = value.filter(|v| !v.trim().is_empty()) {
            lines.push(format!("{label}: {v}"));
        }
    };
    push("正式名称", f.name_legal.as_deref());
    push("所在地", f.hq_address_raw.as_deref());
    push("都道府県", f.prefecture_name.as_deref());
    push("サービス", f.services_text.as_deref());
    push("製品", f.products_text.as_deref());
    push("備考", request.notes.as_deref());
    if let Some(count) = f.employee_count {
        lines.push(format!("従業員数: {count}名"));
    }
    for note in &prior.context {
        lines.push(note.clone());
    }
    lines.join("\n")
}

fn corrective_prompt(violations: &[String]) -> String {
    let mut prompt = String::from("前回の出力は次の条件を満たしていません。修正したJSONオブジェクトのみを返してください。\n");
    for v in violations {
        prompt.push_str(&format!("- {v}\n"));
    }
    prompt
}

/// Check the response shape. More than five hypotheses are truncated to the
/// first five rather than rejected.
fn validate(content: &str) -> Result<Synthesized, Vec<String>> {
    let Some(map) = parse_json_object(content) else {
        return Err(vec!["response is not a JSON object".into()]);
    };
    let mut violations = Vec::new();

    let overview = overview(&map).map(|o| sanitize_text(&o)).unwrap_or_default();
    let overview_len = overview.chars().count();
    if !OVERVIEW_CHARS.contains(&overview_len) {
        violations.push(format!(
            "overview must be {}-{} characters (got {overview_len})",
            OVERVIEW_CHARS.start(),
            OVERVIEW_CHARS.end()
        ));
    }

    let mut hypotheses: Vec<String> = string_list(&map, "pain_hypotheses")
        .iter()
        .map(|h| sanitize_text(h))
        .filter(|h| !h.is_empty())
        .collect();
    let truncated_from = (hypotheses.len() > MAX_PAIN_HYPOTHESES).then_some(hypotheses.len());
    hypotheses.truncate(MAX_PAIN_HYPOTHESES);
    if hypotheses.len() < MIN_HYPOTHESES {
        violations.push(format!(
            "pain_hypotheses must have {MIN_HYPOTHESES}-{MAX_PAIN_HYPOTHESES} items (got {})",
            hypotheses.len()
        ));
    }
    for (i, h) in hypotheses.iter().enumerate() {
        let len = h.chars().count();
        if !HYPOTHESIS_CHARS.contains(&len) {
            violations.push(format!(
                "pain_hypotheses[{i}] must be {}-{} characters (got {len})",
                HYPOTHESIS_CHARS.start(),
                HYPOTHESIS_CHARS.end()
            ));
        }
    }

    let notes = string_field(&map, "personalization_notes")
        .map(|n| sanitize_text(&n))
        .unwrap_or_default();
    let notes_len = notes.chars().count();
    if notes_len == 0 {
        violations.push("personalization_notes is empty".into());
    } else if notes_len > MAX_NOTES_CHARS {
        violations.push(format!(
            "personalization_notes must be at most {MAX_NOTES_CHARS} characters (got {notes_len})"
        ));
    }

    if violations.is_empty() {
        Ok(Synthesized {
            overview,
            hypotheses,
            notes,
            truncated_from,
        })
    } else {
        Err(violations)
    }
}

fn overview(map: &Map<String, Value>) -> Option<String> {
    string_field(map, "overview").or_else(|| string_field(map, "overview_text"))
}
