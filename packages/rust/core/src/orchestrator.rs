//! Per-entity pipeline orchestration.
//!
//! One [`PipelineOrchestrator::run`] call drives an entity through
//! `PENDING → DISCOVERING → EXTRACTING → SYNTHESIZING` to exactly one terminal
//! status, and writes exactly one record upsert for it:
//!
//! - `ok` replaces the whole record.
//! - Every other status only updates `status`, `signals`, and
//!   `last_crawled_at`, so a failed run never degrades earlier content.
//!
//! Transient failures are retried within the invocation on the configured
//! backoff, bounded by a wall-clock budget. Throttling is never waited out
//! here: the run ends `rate_limited` and redelivery tries again later.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};

use enricher_governor::{Clock, RateGovernor};
use enricher_shared::{
    ChatModel, EnrichmentRecord, EnrichmentRequest, EnrichmentStatus, PageFetcher, PipelineConfig,
    RecordFields, RecordStore, SearchProvider, Signals,
};

use crate::merge::Draft;
use crate::phases::{
    DiscoveryPhase, ExtractionPhase, Fatal, PartialBundle, Phase, PhaseOutput, PhaseResult,
    PhaseRunner, SynthesisPhase,
};
use crate::retry::RetryPolicy;

/// External services and the record store the pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub search: Arc<dyn SearchProvider>,
    pub extraction_model: Arc<dyn ChatModel>,
    pub synthesis_model: Arc<dyn ChatModel>,
    pub pages: Arc<dyn PageFetcher>,
    pub store: Arc<dyn RecordStore>,
}

/// Position in the per-entity state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    Discovering,
    Extracting,
    Synthesizing,
    Done(EnrichmentStatus),
}

impl From<Phase> for PipelineState {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Discovery => Self::Discovering,
            Phase::Extraction => Self::Extracting,
            Phase::Synthesis => Self::Synthesizing,
        }
    }
}

/// What one invocation ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: EnrichmentStatus,
    /// Suggested redelivery delay for `rate_limited` and `timeout`.
    pub retry_after: Option<Duration>,
    /// Phase attempts made in this invocation.
    pub attempt_count: u32,
    /// Whether the terminal upsert succeeded.
    pub persisted: bool,
}

#[derive(Debug)]
enum Terminal {
    Ok,
    NotFound(Phase),
    RateLimited(Phase, Duration),
    Timeout {
        phase: Phase,
        retry_after: Duration,
        cause: String,
    },
    Fatal(Phase, Fatal),
}

impl Terminal {
    fn status(&self) -> EnrichmentStatus {
        match self {
            Self::Ok => EnrichmentStatus::Ok,
            Self::NotFound(_) => EnrichmentStatus::NotFound,
            Self::RateLimited(..) => EnrichmentStatus::RateLimited,
            Self::Timeout { .. } => EnrichmentStatus::Timeout,
            Self::Fatal(..) => EnrichmentStatus::ParseError,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited(_, wait) => Some(*wait),
            Self::Timeout { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Mutable accumulator for one invocation. Never outlives it.
struct AttemptState {
    state: PipelineState,
    draft: Draft,
    candidate_pages: Vec<url::Url>,
    context: Vec<String>,
    evidence: Vec<String>,
    attempts: u32,
}

impl AttemptState {
    fn new(draft: Draft) -> Self {
        Self {
            state: PipelineState::Pending,
            draft,
            candidate_pages: Vec::new(),
            context: Vec::new(),
            evidence: Vec::new(),
            attempts: 0,
        }
    }

    fn bundle(&self) -> PartialBundle {
        PartialBundle {
            fields: self.draft.fields().clone(),
            candidate_pages: self.candidate_pages.clone(),
            context: self.context.clone(),
        }
    }

    fn absorb(&mut self, phase: Phase, output: PhaseOutput, evidence: Vec<String>) {
        self.draft.merge(phase, output.fields);
        self.draft.merge_signals(output.signals);
        if !output.candidate_pages.is_empty() {
            self.candidate_pages = output.candidate_pages;
        }
        self.context.extend(output.context);
        for url in evidence {
            if !self.evidence.contains(&url) {
                self.evidence.push(url);
            }
        }
    }
}

pub struct PipelineOrchestrator {
    phases: Vec<Box<dyn PhaseRunner>>,
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    budget: Duration,
}

impl PipelineOrchestrator {
    pub fn new(
        config: &PipelineConfig,
        governor: Arc<RateGovernor>,
        collaborators: Collaborators,
    ) -> Self {
        let shared = Arc::new(config.clone());
        let phases: Vec<Box<dyn PhaseRunner>> = vec![
            Box::new(DiscoveryPhase::new(
                collaborators.search,
                governor.clone(),
                shared.clone(),
            )),
            Box::new(ExtractionPhase::new(
                collaborators.pages,
                collaborators.extraction_model,
                governor.clone(),
                shared.clone(),
            )),
            Box::new(SynthesisPhase::new(
                collaborators.synthesis_model,
                governor.clone(),
                shared,
            )),
        ];
        Self {
            phases,
            store: collaborators.store,
            clock: governor.clock().clone(),
            policy: RetryPolicy::from(config),
            budget: config.invocation_budget,
        }
    }

    /// Run the pipeline for one entity. Never fails: every failure becomes a
    /// terminal status on the returned [`Outcome`].
    #[instrument(skip_all, fields(entity_id = %request.entity_id))]
    pub async fn run(&self, request: &EnrichmentRequest) -> Outcome {
        let started = self.clock.now();
        let persisted = match self.store.get_record(&request.entity_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "could not read persisted record, starting unseeded");
                None
            }
        };

        let mut attempt = AttemptState::new(Draft::seeded(persisted.as_ref()));
        let terminal = self.drive(request, &mut attempt, started).await;
        self.finish(request, attempt, terminal).await
    }

    /// Record a request that failed validation as `parse_error` without
    /// running any phase. Earlier content is left untouched.
    #[instrument(skip_all, fields(entity_id = %request.entity_id))]
    pub async fn record_rejection(&self, request: &EnrichmentRequest, reason: &str) -> bool {
        let mut signals = Signals::new();
        signals.insert("error_kind".into(), json!("invalid_request"));
        signals.insert("error".into(), json!(reason));
        signals.insert("attempt_count".into(), json!(0));
        let record = EnrichmentRecord {
            entity_id: request.entity_id.clone(),
            fields: RecordFields::default(),
            last_crawled_at: Utc::now(),
            status: EnrichmentStatus::ParseError,
            signals,
        };
        match self.store.upsert_status(&record).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "failed to record rejected request");
                false
            }
        }
    }

    async fn drive(
        &self,
        request: &EnrichmentRequest,
        attempt: &mut AttemptState,
        started: Instant,
    ) -> Terminal {
        let deadline = started.checked_add(self.budget);
        for runner in &self.phases {
            let phase = runner.phase();
            attempt.state = PipelineState::from(phase);
            debug!(state = ?attempt.state, "entering phase");

            let mut phase_attempts = 0;
            loop {
                if self.elapsed(started) >= self.budget {
                    return self.budget_exhausted(phase, "invocation budget exhausted".into());
                }
                phase_attempts += 1;
                attempt.attempts += 1;

                let bundle = attempt.bundle();
                let result = tokio::select! {
                    result = runner.run(request, &bundle) => result,
                    () = self.wait_until(deadline) => {
                        return self.budget_exhausted(
                            phase,
                            format!("invocation budget exhausted during {phase}"),
                        );
                    }
                };
                if self.elapsed(started) > self.budget {
                    return self.budget_exhausted(
                        phase,
                        format!("invocation budget exhausted during {phase}"),
                    );
                }

                match result {
                    PhaseResult::Success { value, evidence } => {
                        attempt.absorb(phase, value, evidence);
                        break;
                    }
                    PhaseResult::NotFound => return Terminal::NotFound(phase),
                    PhaseResult::RateLimited(wait) => return Terminal::RateLimited(phase, wait),
                    PhaseResult::FatalError(fatal) => return Terminal::Fatal(phase, fatal),
                    PhaseResult::TransientError(cause) => {
                        let delay = self.policy.delay_for(phase_attempts);
                        warn!(
                            %phase,
                            attempt = phase_attempts,
                            retry_after_ms = delay.as_millis() as u64,
                            cause = %cause,
                            "transient phase failure"
                        );
                        if !self.policy.allows_retry(phase_attempts) {
                            return Terminal::Timeout {
                                phase,
                                retry_after: delay,
                                cause: format!("{cause} (after {phase_attempts} attempts)"),
                            };
                        }
                        if self.elapsed(started) + delay > self.budget {
                            return Terminal::Timeout {
                                phase,
                                retry_after: delay,
                                cause: format!("{cause} (backoff exceeds invocation budget)"),
                            };
                        }
                        self.clock.sleep(delay).await;
                    }
                }
            }
        }
        Terminal::Ok
    }

    async fn finish(
        &self,
        request: &EnrichmentRequest,
        attempt: AttemptState,
        terminal: Terminal,
    ) -> Outcome {
        let status = terminal.status();
        let retry_after = terminal.retry_after();
        let attempt_count = attempt.attempts;

        let mut draft = attempt.draft;
        let signals = draft.signals_mut();
        signals.insert("attempt_count".into(), json!(attempt_count));
        if !attempt.evidence.is_empty() {
            signals.insert("evidence".into(), json!(attempt.evidence));
        }
        match &terminal {
            Terminal::Ok => {}
            Terminal::NotFound(phase) => {
                signals.insert("error_kind".into(), json!("not_found"));
                signals.insert("phase".into(), json!(phase.as_str()));
            }
            Terminal::RateLimited(phase, wait) => {
                signals.insert("error_kind".into(), json!("rate_limited"));
                signals.insert("phase".into(), json!(phase.as_str()));
                signals.insert("retry_after".into(), json!(whole_secs(*wait)));
            }
            Terminal::Timeout {
                phase,
                retry_after,
                cause,
            } => {
                signals.insert("error_kind".into(), json!("timeout"));
                signals.insert("phase".into(), json!(phase.as_str()));
                signals.insert("retry_after".into(), json!(whole_secs(*retry_after)));
                signals.insert("error".into(), Value::String(cause.clone()));
            }
            Terminal::Fatal(phase, fatal) => {
                signals.insert("error_kind".into(), json!(fatal.error_kind()));
                signals.insert("phase".into(), json!(phase.as_str()));
                signals.insert("error".into(), json!(fatal.message()));
                if matches!(fatal, Fatal::Auth(_)) {
                    signals.insert("auth_failure".into(), json!(true));
                }
            }
        }

        let record = draft.into_record(request.entity_id.clone(), status, Utc::now());
        let written = if status == EnrichmentStatus::Ok {
            self.store.upsert_record(&record).await
        } else {
            self.store.upsert_status(&record).await
        };
        let persisted = match written {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, %status, "failed to persist enrichment record");
                false
            }
        };

        info!(
            state = ?PipelineState::Done(status),
            %status,
            attempt_count,
            retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
            "enrichment finished"
        );

        Outcome {
            status,
            retry_after,
            attempt_count,
            persisted,
        }
    }

    fn elapsed(&self, started: Instant) -> Duration {
        self.clock.now().saturating_duration_since(started)
    }

    /// A budget too large to express as an instant never expires.
    async fn wait_until(&self, deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => self.clock.sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    fn budget_exhausted(&self, phase: Phase, cause: String) -> Terminal {
        Terminal::Timeout {
            phase,
            retry_after: self.policy.delay_for(1),
            cause,
        }
    }
}

/// Seconds, rounded up so a sub-second wait is never reported as zero.
fn whole_secs(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis().div_ceil(1000)).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use enricher_shared::ProviderError;

    fn transient() -> ProviderError {
        ProviderError::Transient("HTTP 503: upstream unavailable".into())
    }

    #[tokio::test]
    async fn end_to_end_success() {
        let h = Harness::new();
        let outcome = h.orchestrator(test_pipeline_config()).run(&example_request()).await;

        assert_eq!(
            outcome,
            Outcome {
                status: EnrichmentStatus::Ok,
                retry_after: None,
                attempt_count: 3,
                persisted: true,
            }
        );
        let record = h.store.record(&example_request().entity_id).unwrap();
        assert_eq!(record.status, EnrichmentStatus::Ok);
        assert_eq!(record.fields.pain_hypotheses.len(), 4);
        assert_eq!(record.signals["attempt_count"], json!(3));
        assert_eq!(
            record.fields.overview_text.as_ref().map(|o| o.chars().count()),
            Some(300)
        );
        assert_eq!(
            record.fields.hq_address_raw.as_deref(),
            Some("〒150-0002 東京都渋谷区渋谷2-21-1")
        );
        assert_eq!(
            record.fields.services_text.as_deref(),
            Some("・クラウド導入支援\n・業務システム開発")
        );
        assert!(!record.signals.contains_key("error_kind"));
        assert_eq!(h.store.full_upserts.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(h.store.upserts(), 1);
    }

    #[tokio::test]
    async fn not_found_skips_extraction_and_synthesis() {
        let h = Harness::with(
            ScriptedSearch::always(Ok(Vec::new())),
            ScriptedChat::always("sonar", Ok(extraction_json())),
            ScriptedChat::always("gpt-5-mini", Ok(synthesis_json(4))),
        );
        let outcome = h.orchestrator(test_pipeline_config()).run(&example_request()).await;

        assert_eq!(outcome.status, EnrichmentStatus::NotFound);
        assert_eq!(outcome.attempt_count, 1);
        assert_eq!(h.pages.calls(), 0);
        assert_eq!(h.extraction.calls(), 0);
        assert_eq!(h.synthesis.calls(), 0);

        let record = h.store.record(&example_request().entity_id).unwrap();
        assert_eq!(record.status, EnrichmentStatus::NotFound);
        assert_eq!(record.signals["error_kind"], json!("not_found"));
        assert_eq!(h.store.upserts(), 1);
    }

    #[tokio::test]
    async fn rate_limited_discovery_writes_status_only() {
        let h = Harness::with(
            ScriptedSearch::always(Err(ProviderError::RateLimited {
                retry_after: Some(secs(60)),
            })),
            ScriptedChat::always("sonar", Ok(extraction_json())),
            ScriptedChat::always("gpt-5-mini", Ok(synthesis_json(4))),
        );
        let outcome = h.orchestrator(test_pipeline_config()).run(&example_request()).await;

        assert_eq!(outcome.status, EnrichmentStatus::RateLimited);
        assert_eq!(outcome.retry_after, Some(secs(60)));
        assert_eq!(h.clock.elapsed(), Duration::ZERO);

        let record = h.store.record(&example_request().entity_id).unwrap();
        assert_eq!(record.status, EnrichmentStatus::RateLimited);
        assert_eq!(record.fields, RecordFields::default());
        assert_eq!(record.signals["retry_after"], json!(60));
        assert_eq!(h.store.status_upserts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_exhaust_to_timeout() {
        let h = Harness::with(
            ScriptedSearch::always(Err(transient())),
            ScriptedChat::always("sonar", Ok(extraction_json())),
            ScriptedChat::always("gpt-5-mini", Ok(synthesis_json(4))),
        );
        let config = PipelineConfig {
            invocation_budget: secs(3 * 3600),
            ..test_pipeline_config()
        };
        let outcome = h.orchestrator(config).run(&example_request()).await;

        assert_eq!(outcome.status, EnrichmentStatus::Timeout);
        assert_eq!(outcome.attempt_count, 5);
        assert_eq!(h.search.calls(), 5);
        // 1m + 5m + 15m + 60m between the five attempts.
        assert_eq!(h.clock.elapsed(), secs(60 + 300 + 900 + 3600));
        assert_eq!(h.extraction.calls(), 0);

        let record = h.store.record(&example_request().entity_id).unwrap();
        assert_eq!(record.status, EnrichmentStatus::Timeout);
        assert!(record.fields.is_empty());
        assert_eq!(record.signals["error_kind"], json!("timeout"));
        assert_eq!(h.store.upserts(), 1);
    }

    #[tokio::test]
    async fn backoff_past_budget_times_out_early() {
        let h = Harness::with(
            ScriptedSearch::always(Err(transient())),
            ScriptedChat::always("sonar", Ok(extraction_json())),
            ScriptedChat::always("gpt-5-mini", Ok(synthesis_json(4))),
        );
        let outcome = h.orchestrator(test_pipeline_config()).run(&example_request()).await;

        // 60s + 300s fit in 540s; the next 900s step does not.
        assert_eq!(outcome.status, EnrichmentStatus::Timeout);
        assert_eq!(h.search.calls(), 3);
        assert_eq!(h.clock.elapsed(), secs(360));
        assert_eq!(outcome.retry_after, Some(secs(900)));
    }

    #[tokio::test]
    async fn slow_call_is_cut_off_at_the_budget() {
        let h = Harness::new();
        h.synthesis.stall(h.clock.clone(), secs(600));
        let outcome = h.orchestrator(test_pipeline_config()).run(&example_request()).await;

        assert_eq!(outcome.status, EnrichmentStatus::Timeout);
        assert_eq!(outcome.retry_after, Some(secs(60)));
        assert_eq!(h.synthesis.calls(), 1);

        let record = h.store.record(&example_request().entity_id).unwrap();
        assert_eq!(record.status, EnrichmentStatus::Timeout);
        assert_eq!(record.signals["error_kind"], json!("timeout"));
        assert_eq!(record.signals["phase"], json!("synthesis"));
        assert!(record.fields.overview_text.is_none());
    }

    #[tokio::test]
    async fn transient_then_success_continues() {
        let h = Harness::with(
            ScriptedSearch::always(Ok(example_hits())).then(Err(transient())),
            ScriptedChat::always("sonar", Ok(extraction_json())),
            ScriptedChat::always("gpt-5-mini", Ok(synthesis_json(4))),
        );
        let outcome = h.orchestrator(test_pipeline_config()).run(&example_request()).await;

        assert_eq!(outcome.status, EnrichmentStatus::Ok);
        assert_eq!(outcome.attempt_count, 4);
        assert_eq!(h.clock.elapsed(), secs(60));
    }

    #[tokio::test]
    async fn auth_failure_short_circuits() {
        let h = Harness::with(
            ScriptedSearch::always(Ok(example_hits())),
            ScriptedChat::always("sonar", Err(ProviderError::Auth("HTTP 401: invalid key".into()))),
            ScriptedChat::always("gpt-5-mini", Ok(synthesis_json(4))),
        );
        let outcome = h.orchestrator(test_pipeline_config()).run(&example_request()).await;

        assert_eq!(outcome.status, EnrichmentStatus::ParseError);
        assert_eq!(h.extraction.calls(), 1);
        assert_eq!(h.synthesis.calls(), 0);
        let record = h.store.record(&example_request().entity_id).unwrap();
        assert_eq!(record.signals["error_kind"], json!("auth_error"));
        assert_eq!(record.signals["auth_failure"], json!(true));
        assert_eq!(record.signals["phase"], json!("extraction"));
    }

    #[tokio::test]
    async fn extraction_cannot_overwrite_discovery() {
        let extraction = serde_json::json!({
            "address_lines": ["大阪府大阪市北区梅田1-1-1"],
            "service_heads": ["受託開発"]
        })
        .to_string();
        let h = Harness::with(
            ScriptedSearch::always(Ok(example_hits())),
            ScriptedChat::always("sonar", Ok(extraction)),
            ScriptedChat::always("gpt-5-mini", Ok(synthesis_json(4))),
        );
        h.orchestrator(test_pipeline_config()).run(&example_request()).await;

        let record = h.store.record(&example_request().entity_id).unwrap();
        assert_eq!(
            record.fields.hq_address_raw.as_deref(),
            Some("〒150-0002 東京都渋谷区渋谷2-21-1")
        );
        assert_eq!(record.fields.prefecture_name.as_deref(), Some("東京都"));
        assert_eq!(record.fields.services_text.as_deref(), Some("・受託開発"));
        assert_eq!(record.signals["merge_conflicts"][0]["field"], json!("hq_address_raw"));
    }

    #[tokio::test]
    async fn later_success_replaces_ok_record() {
        let h = Harness::new();
        let id = example_request().entity_id;
        h.store.seed(EnrichmentRecord {
            entity_id: id.clone(),
            fields: RecordFields {
                overview_text: Some("古い概要".into()),
                pain_hypotheses: vec!["古い仮説".into()],
                ..RecordFields::default()
            },
            last_crawled_at: Utc::now(),
            status: EnrichmentStatus::Ok,
            signals: Signals::new(),
        });

        let outcome = h.orchestrator(test_pipeline_config()).run(&example_request()).await;
        assert_eq!(outcome.status, EnrichmentStatus::Ok);
        let record = h.store.record(&id).unwrap();
        assert_eq!(record.fields.overview_text.as_ref().map(|o| o.chars().count()), Some(300));
        assert_eq!(record.fields.pain_hypotheses.len(), 4);
        assert!(!record.fields.pain_hypotheses.contains(&"古い仮説".to_string()));
    }

    #[tokio::test]
    async fn failed_record_seeds_gaps_only() {
        let h = Harness::new();
        let id = example_request().entity_id;
        h.store.seed(EnrichmentRecord {
            entity_id: id.clone(),
            fields: RecordFields {
                hq_address_raw: Some("東京都港区芝公園4-2-8".into()),
                ..RecordFields::default()
            },
            last_crawled_at: Utc::now(),
            status: EnrichmentStatus::Timeout,
            signals: Signals::new(),
        });

        h.orchestrator(test_pipeline_config()).run(&example_request()).await;
        let record = h.store.record(&id).unwrap();
        assert_eq!(record.status, EnrichmentStatus::Ok);
        assert_eq!(record.fields.hq_address_raw.as_deref(), Some("東京都港区芝公園4-2-8"));
        assert!(record.fields.services_text.is_some());
    }

    #[tokio::test]
    async fn stale_synthesis_is_replaced_after_a_status_only_write() {
        let h = Harness::new();
        let id = example_request().entity_id;
        let stale: Vec<String> = (0..4).map(|i| format!("古い仮説{i}")).collect();
        h.store.seed(EnrichmentRecord {
            entity_id: id.clone(),
            fields: RecordFields {
                hq_address_raw: Some("東京都港区芝公園4-2-8".into()),
                overview_text: Some("古い概要".into()),
                pain_hypotheses: stale.clone(),
                personalization_notes: Some("古いメモ".into()),
                ..RecordFields::default()
            },
            last_crawled_at: Utc::now(),
            status: EnrichmentStatus::RateLimited,
            signals: Signals::new(),
        });

        h.orchestrator(test_pipeline_config()).run(&example_request()).await;
        let record = h.store.record(&id).unwrap();
        assert_eq!(record.status, EnrichmentStatus::Ok);
        assert_eq!(record.fields.hq_address_raw.as_deref(), Some("東京都港区芝公園4-2-8"));
        assert_eq!(record.fields.overview_text.as_deref().map(|t| t.chars().count()), Some(300));
        assert_eq!(record.fields.pain_hypotheses.len(), 4);
        assert!(record.fields.pain_hypotheses.iter().all(|h| !stale.contains(h)));
        assert_ne!(record.fields.personalization_notes.as_deref(), Some("古いメモ"));
    }

    #[tokio::test]
    async fn six_hypotheses_persist_as_five() {
        let h = Harness::with(
            ScriptedSearch::always(Ok(example_hits())),
            ScriptedChat::always("sonar", Ok(extraction_json())),
            ScriptedChat::always("gpt-5-mini", Ok(synthesis_json(6))),
        );
        h.orchestrator(test_pipeline_config()).run(&example_request()).await;

        let record = h.store.record(&example_request().entity_id).unwrap();
        assert_eq!(record.status, EnrichmentStatus::Ok);
        assert_eq!(record.fields.pain_hypotheses.len(), 5);
        assert_eq!(record.signals["hypotheses_truncated_from"], json!(6));
    }

    #[tokio::test]
    async fn exhausted_budget_before_a_phase_times_out() {
        let h = Harness::new();
        let config = PipelineConfig {
            invocation_budget: Duration::ZERO,
            ..test_pipeline_config()
        };
        let outcome = h.orchestrator(config).run(&example_request()).await;
        assert_eq!(outcome.status, EnrichmentStatus::Timeout);
        assert_eq!(outcome.attempt_count, 0);
        assert_eq!(h.search.calls(), 0);
    }

    #[tokio::test]
    async fn store_failure_is_reported() {
        let h = Harness::new();
        h.store
            .fail_writes
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let outcome = h.orchestrator(test_pipeline_config()).run(&example_request()).await;
        assert_eq!(outcome.status, EnrichmentStatus::Ok);
        assert!(!outcome.persisted);
    }

    #[test]
    fn whole_secs_rounds_up() {
        assert_eq!(whole_secs(Duration::from_millis(1500)), 2);
        assert_eq!(whole_secs(secs(60)), 60);
        assert_eq!(whole_secs(Duration::MAX), u64::MAX);
    }
}
