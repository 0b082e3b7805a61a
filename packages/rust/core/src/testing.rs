//! Scripted collaborators for engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use enricher_governor::{Clock, ManualClock, RateGovernor};
use enricher_shared::{
    ChatModel, ChatRequest, DeadLetterSink, EnricherError, EnrichmentRecord, EnrichmentRequest,
    EntityId, GovernorConfig, PageFetcher, PipelineConfig, ProviderError, ProviderResult,
    RecordStore, Result, SearchHit, SearchProvider, SourceCatalog,
};

use crate::orchestrator::{Collaborators, PipelineOrchestrator};

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Search provider that replays scripted responses, then a fallback.
pub struct ScriptedSearch {
    script: Mutex<VecDeque<ProviderResult<Vec<SearchHit>>>>,
    fallback: ProviderResult<Vec<SearchHit>>,
    pub queries: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedSearch {
    pub fn always(response: ProviderResult<Vec<SearchHit>>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: response,
            queries: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn then(self, response: ProviderResult<Vec<SearchHit>>) -> Self {
        self.script.lock().unwrap().push_back(response);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchProvider for ScriptedSearch {
    async fn search(&self, query: &str, _max_results: usize) -> ProviderResult<Vec<SearchHit>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.to_string());
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Chat model that replays scripted responses, then a fallback.
pub struct ScriptedChat {
    name: &'static str,
    script: Mutex<VecDeque<ProviderResult<String>>>,
    fallback: ProviderResult<String>,
    pub requests: Mutex<Vec<ChatRequest>>,
    calls: AtomicUsize,
    latency: Mutex<Option<(Arc<ManualClock>, Duration)>>,
}

impl ScriptedChat {
    pub fn always(name: &'static str, response: ProviderResult<String>) -> Self {
        Self {
            name,
            script: Mutex::new(VecDeque::new()),
            fallback: response,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            latency: Mutex::new(None),
        }
    }

    /// Every later call spends `delay` of virtual time on `clock` before answering.
    pub fn stall(&self, clock: Arc<ManualClock>, delay: Duration) {
        *self.latency.lock().unwrap() = Some((clock, delay));
    }

    pub fn then(self, response: ProviderResult<String>) -> Self {
        self.script.lock().unwrap().push_back(response);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    async fn complete(&self, request: ChatRequest) -> ProviderResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let latency = self.latency.lock().unwrap().clone();
        if let Some((clock, delay)) = latency {
            clock.sleep(delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }

    fn model_name(&self) -> &str {
        self.name
    }
}

/// Page fetcher serving fixed bodies; unknown URLs are 404s.
#[derive(Default)]
pub struct StaticPages {
    pages: HashMap<String, ProviderResult<String>>,
    calls: AtomicUsize,
}

impl StaticPages {
    pub fn with(mut self, url: &str, body: ProviderResult<String>) -> Self {
        self.pages.insert(url.to_string(), body);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageFetcher for StaticPages {
    async fn fetch_text(&self, url: &Url) -> ProviderResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.pages
            .get(url.as_str())
            .cloned()
            .unwrap_or_else(|| Err(ProviderError::Rejected(format!("HTTP 404: {url}"))))
    }
}

// ---------------------------------------------------------------------------
// Store and sinks
// ---------------------------------------------------------------------------

/// In-memory record store with the libSQL store's write semantics.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<EntityId, EnrichmentRecord>>,
    pub full_upserts: AtomicUsize,
    pub status_upserts: AtomicUsize,
    pub fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn seed(&self, record: EnrichmentRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.entity_id.clone(), record);
    }

    pub fn record(&self, id: &EntityId) -> Option<EnrichmentRecord> {
        self.records.lock().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn upserts(&self) -> usize {
        self.full_upserts.load(Ordering::SeqCst) + self.status_upserts.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EnricherError::Storage("store unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get_record(&self, entity_id: &EntityId) -> Result<Option<EnrichmentRecord>> {
        Ok(self.record(entity_id))
    }

    async fn upsert_record(&self, record: &EnrichmentRecord) -> Result<()> {
        self.check_writable()?;
        self.full_upserts.fetch_add(1, Ordering::SeqCst);
        self.seed(record.clone());
        Ok(())
    }

    async fn upsert_status(&self, record: &EnrichmentRecord) -> Result<()> {
        self.check_writable()?;
        self.status_upserts.fetch_add(1, Ordering::SeqCst);
        let mut records = self.records.lock().unwrap();
        match records.get_mut(&record.entity_id) {
            Some(existing) => {
                existing.status = record.status;
                existing.signals = record.signals.clone();
                existing.last_crawled_at = record.last_crawled_at;
            }
            None => {
                let bare = EnrichmentRecord {
                    fields: Default::default(),
                    ..record.clone()
                };
                records.insert(record.entity_id.clone(), bare);
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCatalog {
    pub sources: Vec<EnrichmentRequest>,
}

#[async_trait]
impl SourceCatalog for MemoryCatalog {
    async fn pending_sources(
        &self,
        industry: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EnrichmentRequest>> {
        Ok(self
            .sources
            .iter()
            .filter(|s| industry.is_none_or(|i| s.industry == i))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LetterEntry {
    pub entity_id: Option<String>,
    pub reason: String,
    pub attempts: u32,
}

#[derive(Default)]
pub struct MemoryDeadLetters {
    pub letters: Mutex<Vec<LetterEntry>>,
}

impl MemoryDeadLetters {
    pub fn entries(&self) -> Vec<LetterEntry> {
        self.letters.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    async fn record_dead_letter(
        &self,
        entity_id: Option<&EntityId>,
        _payload: &str,
        reason: &str,
        attempts: u32,
    ) -> Result<()> {
        self.letters.lock().unwrap().push(LetterEntry {
            entity_id: entity_id.map(|id| id.to_string()),
            reason: reason.to_string(),
            attempts,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn example_request() -> EnrichmentRequest {
    EnrichmentRequest {
        entity_id: EntityId::from_website("example.com").unwrap(),
        name: "Example Corp".into(),
        industry: "IT・web".into(),
        prefecture: None,
        inquiry_url: None,
        notes: None,
    }
}

pub fn request_for(website: &str) -> EnrichmentRequest {
    EnrichmentRequest {
        entity_id: EntityId::from_website(website).unwrap(),
        ..example_request()
    }
}

/// Governor generous enough that tests never wait on it.
pub fn open_governor(clock: Arc<ManualClock>) -> Arc<RateGovernor> {
    let config = GovernorConfig {
        origin_rps: 1000.0,
        origin_burst: 100,
        global_rps: 1000.0,
        global_burst: 100,
        ..GovernorConfig::default()
    };
    Arc::new(RateGovernor::new(config, clock))
}

pub fn test_pipeline_config() -> PipelineConfig {
    PipelineConfig {
        max_search_queries: 1,
        results_per_query: 5,
        max_extraction_pages: 2,
        page_max_chars: 10_000,
        ..PipelineConfig::default()
    }
}

pub fn hit(url: &str, title: &str, snippet: &str) -> SearchHit {
    SearchHit {
        url: url.into(),
        title: title.into(),
        snippet: snippet.into(),
    }
}

/// Hits for example.com, one of which names the headquarters address.
pub fn example_hits() -> Vec<SearchHit> {
    vec![
        hit(
            "https://example.com/company",
            "会社概要 | Example Corp",
            "株式会社エグザンプル 本社所在地 〒150-0002 東京都渋谷区渋谷2-21-1",
        ),
        hit("https://example.com/service", "サービス | Example Corp", "クラウド事業"),
    ]
}

pub fn extraction_json() -> String {
    serde_json::json!({
        "name_legal": "株式会社エグザンプル",
        "address_lines": [],
        "employee_mentions": ["従業員数 120名"],
        "service_heads": ["クラウド導入支援", "業務システム開発"],
        "product_heads": ["Example CRM"],
        "news_headlines": ["新オフィス開設のお知らせ"],
        "company_description": "法人向けのクラウド導入支援を行う企業"
    })
    .to_string()
}

/// A synthesis response that satisfies every shape rule.
pub fn synthesis_json(hypotheses: usize) -> String {
    synthesis_json_with(300, hypotheses, 100)
}

pub fn synthesis_json_with(overview_chars: usize, hypotheses: usize, hypothesis_chars: usize) -> String {
    let items: Vec<String> = (0..hypotheses)
        .map(|i| format!("{i}{}", "課".repeat(hypothesis_chars - 1)))
        .collect();
    serde_json::json!({
        "overview": "概".repeat(overview_chars),
        "pain_hypotheses": items,
        "personalization_notes": "渋谷本社。クラウド導入支援に注力。"
    })
    .to_string()
}

pub fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

pub const COMPANY_PAGE_TEXT: &str = "会社概要\n商号 株式会社エグザンプル\n所在地 〒150-0002 東京都渋谷区渋谷2-21-1\n従業員数 120名";

/// Scripted collaborators on a shared virtual clock.
pub struct Harness {
    pub search: Arc<ScriptedSearch>,
    pub extraction: Arc<ScriptedChat>,
    pub synthesis: Arc<ScriptedChat>,
    pub pages: Arc<StaticPages>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    /// Every collaborator succeeds.
    pub fn new() -> Self {
        Self::with(
            ScriptedSearch::always(Ok(example_hits())),
            ScriptedChat::always("sonar", Ok(extraction_json())),
            ScriptedChat::always("gpt-5-mini", Ok(synthesis_json(4))),
        )
    }

    pub fn with(search: ScriptedSearch, extraction: ScriptedChat, synthesis: ScriptedChat) -> Self {
        Self {
            search: Arc::new(search),
            extraction: Arc::new(extraction),
            synthesis: Arc::new(synthesis),
            pages: Arc::new(
                StaticPages::default()
                    .with("https://example.com/company", Ok(COMPANY_PAGE_TEXT.into())),
            ),
            store: Arc::new(MemoryStore::default()),
            clock: Arc::new(ManualClock::new()),
        }
    }

    pub fn orchestrator(&self, config: PipelineConfig) -> PipelineOrchestrator {
        PipelineOrchestrator::new(
            &config,
            open_governor(self.clock.clone()),
            Collaborators {
                search: self.search.clone(),
                extraction_model: self.extraction.clone(),
                synthesis_model: self.synthesis.clone(),
                pages: self.pages.clone(),
                store: self.store.clone(),
            },
        )
    }
}
