//! Discovery: locate official pages and early signals through web search.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, instrument};
use url::Url;

use enricher_governor::RateGovernor;
use enricher_shared::text::{
    extract_address, extract_employee_count, extract_legal_name, extract_prefecture,
};
use enricher_shared::{
    EnrichmentRequest, PipelineConfig, RateLimitKey, RecordFields, SearchHit, SearchProvider,
    Signals,
};

use super::{Phase, PhaseOutput, PhaseResult, PhaseRunner, PartialBundle, permit};

/// Page keywords on the entity's own site.
const SITE_KEYWORDS: &str =
    "会社概要 OR 会社情報 OR 事業内容 OR サービス OR 製品 OR about OR company OR business OR services OR products";

/// What a search hit appears to be, best candidates first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PageKind {
    About,
    Business,
    Product,
    News,
    Other,
    Legal,
}

impl PageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::About => "about",
            Self::Business => "business",
            Self::Product => "product",
            Self::News => "news",
            Self::Other => "other",
            Self::Legal => "legal",
        }
    }

    /// Classify by URL and title keywords.
    pub fn classify(url: &str, title: &str) -> Self {
        let haystack = format!("{} {}", url.to_lowercase(), title.to_lowercase());
        let has = |words: &[&str]| words.iter().any(|w| haystack.contains(w));

        if has(&["privacy", "terms", "policy", "legal", "プライバシー", "規約", "個人情報"]) {
            Self::Legal
        } else if has(&[
            "company", "about", "corporate", "profile", "outline", "overview", "会社概要",
            "会社情報", "企業情報",
        ]) {
            Self::About
        } else if has(&["business", "service", "solution", "事業", "サービス"]) {
            Self::Business
        } else if has(&["product", "製品", "商品"]) {
            Self::Product
        } else if has(&["news", "press", "release", "topics", "ニュース", "お知らせ"]) {
            Self::News
        } else {
            Self::Other
        }
    }
}

/// The search queries for an entity, in priority order.
pub fn query_plan(request: &EnrichmentRequest) -> Vec<String> {
    let name = request.name.trim();
    vec![
        format!("site:{} ({SITE_KEYWORDS})", request.entity_id.domain()),
        format!("\"{name}\" 本社 住所"),
        format!("\"{name}\" 従業員数"),
    ]
}

pub struct DiscoveryPhase {
    search: Arc<dyn SearchProvider>,
    governor: Arc<RateGovernor>,
    config: Arc<PipelineConfig>,
}

impl DiscoveryPhase {
    pub fn new(
        search: Arc<dyn SearchProvider>,
        governor: Arc<RateGovernor>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            search,
            governor,
            config,
        }
    }
}

#[async_trait]
impl PhaseRunner for DiscoveryPhase {
    fn phase(&self) -> Phase {
        Phase::Discovery
    }

    #[instrument(skip_all, fields(entity_id = %request.entity_id, phase = "discovery"))]
    async fn run(
        &self,
        request: &EnrichmentRequest,
        _prior: &PartialBundle,
    ) -> PhaseResult<PhaseOutput> {
        let key = request.origin_key();
        let mut seen = HashSet::new();
        let mut hits: Vec<SearchHit> = Vec::new();

        let queries = query_plan(request);
        let planned = queries.len().min(self.config.max_search_queries);
        for query in queries.iter().take(planned) {
            if let Err(wait) = permit(&self.governor, &key, self.config.max_permit_wait).await {
                return PhaseResult::RateLimited(wait);
            }
            match self.search.search(query, self.config.results_per_query).await {
                Ok(found) => {
                    debug!(query = %query, hits = found.len(), "search returned");
                    hits.extend(found.into_iter().filter(|h| seen.insert(h.url.clone())));
                }
                Err(err) => return err.into(),
            }
        }

        if hits.is_empty() {
            return PhaseResult::NotFound;
        }

        let (fields, mut evidence) = mine_snippets(request, &hits);
        let candidate_pages = rank_candidates(request, &hits, self.config.max_extraction_pages);
        evidence.extend(candidate_pages.iter().map(|u| u.to_string()));
        let mut cited = HashSet::new();
        evidence.retain(|url| cited.insert(url.clone()));

        let mut signals = Signals::new();
        signals.insert("search_queries".into(), json!(planned));
        signals.insert("search_hits".into(), json!(hits.len()));

        PhaseResult::Success {
            value: PhaseOutput {
                fields,
                candidate_pages,
                context: Vec::new(),
                signals,
            },
            evidence,
        }
    }
}

/// Pull address, prefecture, legal name, and headcount out of result snippets.
///
/// The first hit (by rank) carrying a value wins for each field.
fn mine_snippets(request: &EnrichmentRequest, hits: &[SearchHit]) -> (RecordFields, Vec<String>) {
    let mut fields = RecordFields {
        industry: Some(request.industry.trim().to_string()),
        ..RecordFields::default()
    };
    let mut evidence = Vec::new();

    for hit in hits {
        let text = format!("{}\n{}", hit.title, hit.snippet);
        let mut used = false;

        if fields.hq_address_raw.is_none() {
            fields.hq_address_raw = extract_address(&text);
            used |= fields.hq_address_raw.is_some();
        }
        if fields.name_legal.is_none() {
            fields.name_legal = extract_legal_name(&text);
            used |= fields.name_legal.is_some();
        }
        if fields.employee_count.is_none() {
            if let Some(count) = extract_employee_count(&text) {
                fields.employee_count = Some(count);
                fields.employee_count_source_url = Some(hit.url.clone());
                used = true;
            }
        }
        if used {
            evidence.push(hit.url.clone());
        }
    }

    fields.prefecture_name = fields
        .hq_address_raw
        .as_deref()
        .and_then(extract_prefecture)
        .map(String::from)
        .or_else(|| request.prefecture.clone().filter(|p| !p.trim().is_empty()));

    (fields, evidence)
}

/// Candidate pages for Extraction: same-domain first, then by page kind.
/// Legal pages are never candidates. Falls back to the entity's own site.
fn rank_candidates(request: &EnrichmentRequest, hits: &[SearchHit], max: usize) -> Vec<Url> {
    let own = request.origin_key();
    let mut ranked: Vec<(bool, PageKind, usize, Url)> = hits
        .iter()
        .enumerate()
        .filter_map(|(rank, hit)| {
            let url = Url::parse(&hit.url).ok()?;
            if !matches!(url.scheme(), "http" | "https") {
                return None;
            }
            let kind = PageKind::classify(&hit.url, &hit.title);
            if kind == PageKind::Legal {
                return None;
            }
            let foreign = RateLimitKey::for_url(url.as_str()).as_ref() != Some(&own);
            Some((foreign, kind, rank, url))
        })
        .collect();
    ranked.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));

    let mut pages: Vec<Url> = ranked.into_iter().map(|(_, _, _, url)| url).take(max).collect();
    if pages.is_empty() {
        pages.extend(request.entity_id.url());
    }
    pages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::Fatal;
    use crate::testing::*;
    use enricher_governor::ManualClock;
    use enricher_shared::{GovernorConfig, ProviderError};

    fn phase(search: Arc<ScriptedSearch>, config: PipelineConfig) -> DiscoveryPhase {
        let clock = Arc::new(ManualClock::new());
        DiscoveryPhase::new(search, open_governor(clock), Arc::new(config))
    }

    #[test]
    fn classifies_pages() {
        assert_eq!(PageKind::classify("https://a.jp/company/", ""), PageKind::About);
        assert_eq!(PageKind::classify("https://a.jp/x", "会社概要"), PageKind::About);
        assert_eq!(PageKind::classify("https://a.jp/service", ""), PageKind::Business);
        assert_eq!(PageKind::classify("https://a.jp/products/crm", ""), PageKind::Product);
        assert_eq!(PageKind::classify("https://a.jp/news/1", ""), PageKind::News);
        assert_eq!(PageKind::classify("https://a.jp/privacy", "会社概要"), PageKind::Legal);
        assert_eq!(PageKind::classify("https://a.jp/", "トップ"), PageKind::Other);
    }

    #[test]
    fn query_plan_targets_site_then_name() {
        let plan = query_plan(&example_request());
        assert_eq!(plan.len(), 3);
        assert!(plan[0].starts_with("site:example.com ("));
        assert_eq!(plan[1], "\"Example Corp\" 本社 住所");
        assert_eq!(plan[2], "\"Example Corp\" 従業員数");
    }

    #[tokio::test]
    async fn success_mines_snippets_and_ranks_pages() {
        let search = Arc::new(ScriptedSearch::always(Ok(vec![
            hit("https://news.example.org/article", "Example Corp 特集", "従業員数 85名"),
            hit("https://example.com/privacy", "プライバシーポリシー", ""),
            hit("https://example.com/service", "サービス", ""),
            hit(
                "https://example.com/company",
                "会社概要",
                "株式会社エグザンプル 〒150-0002 東京都渋谷区渋谷2-21-1",
            ),
        ])));
        let config = PipelineConfig {
            max_extraction_pages: 3,
            ..test_pipeline_config()
        };

        let result = phase(search.clone(), config)
            .run(&example_request(), &PartialBundle::default())
            .await;
        let PhaseResult::Success { value, evidence } = result else {
            panic!("expected success, got {result:?}");
        };

        assert_eq!(search.calls(), 1);
        assert_eq!(
            value.fields.hq_address_raw.as_deref(),
            Some("〒150-0002 東京都渋谷区渋谷2-21-1")
        );
        assert_eq!(value.fields.prefecture_name.as_deref(), Some("東京都"));
        assert_eq!(value.fields.name_legal.as_deref(), Some("株式会社エグザンプル"));
        assert_eq!(value.fields.employee_count, Some(85));
        assert_eq!(
            value.fields.employee_count_source_url.as_deref(),
            Some("https://news.example.org/article")
        );
        assert_eq!(value.fields.industry.as_deref(), Some("IT・web"));

        let pages: Vec<&str> = value.candidate_pages.iter().map(Url::as_str).collect();
        assert_eq!(
            pages,
            vec![
                "https://example.com/company",
                "https://example.com/service",
                "https://news.example.org/article"
            ]
        );
        assert!(evidence.contains(&"https://example.com/company".to_string()));
        assert_eq!(value.signals["search_hits"], json!(4));
    }

    #[tokio::test]
    async fn queries_are_capped_and_hits_deduplicated() {
        let search = Arc::new(ScriptedSearch::always(Ok(example_hits())));
        let config = PipelineConfig {
            max_search_queries: 3,
            ..test_pipeline_config()
        };
        let result = phase(search.clone(), config)
            .run(&example_request(), &PartialBundle::default())
            .await;
        let PhaseResult::Success { value, .. } = result else {
            panic!("expected success");
        };
        assert_eq!(search.calls(), 3);
        assert_eq!(value.signals["search_hits"], json!(2));
    }

    #[tokio::test]
    async fn no_hits_is_not_found() {
        let search = Arc::new(ScriptedSearch::always(Ok(Vec::new())));
        let result = phase(search, test_pipeline_config())
            .run(&example_request(), &PartialBundle::default())
            .await;
        assert_eq!(result, PhaseResult::NotFound);
    }

    #[tokio::test]
    async fn provider_failures_are_typed() {
        let limited = Arc::new(ScriptedSearch::always(Err(ProviderError::RateLimited {
            retry_after: Some(secs(60)),
        })));
        let result = phase(limited, test_pipeline_config())
            .run(&example_request(), &PartialBundle::default())
            .await;
        assert_eq!(result, PhaseResult::RateLimited(secs(60)));

        let down = Arc::new(ScriptedSearch::always(Err(ProviderError::Transient(
            "connection reset".into(),
        ))));
        let result = phase(down, test_pipeline_config())
            .run(&example_request(), &PartialBundle::default())
            .await;
        assert!(matches!(result, PhaseResult::TransientError(_)));

        let auth = Arc::new(ScriptedSearch::always(Err(ProviderError::Auth("401".into()))));
        let result = phase(auth, test_pipeline_config())
            .run(&example_request(), &PartialBundle::default())
            .await;
        assert!(matches!(result, PhaseResult::FatalError(Fatal::Auth(_))));
    }

    #[tokio::test]
    async fn throttled_governor_defers_to_redelivery() {
        let clock = Arc::new(ManualClock::new());
        let config = GovernorConfig {
            origin_rps: 0.01,
            origin_burst: 1,
            ..GovernorConfig::default()
        };
        let governor = Arc::new(RateGovernor::new(config, clock));
        let search = Arc::new(ScriptedSearch::always(Ok(example_hits())));
        let discovery = DiscoveryPhase::new(
            search.clone(),
            governor,
            Arc::new(PipelineConfig {
                max_search_queries: 2,
                ..test_pipeline_config()
            }),
        );

        let result = discovery
            .run(&example_request(), &PartialBundle::default())
            .await;
        // First query spends the only token; the second would wait 100s.
        assert!(matches!(result, PhaseResult::RateLimited(wait) if wait > secs(30)));
        assert_eq!(search.calls(), 1);
    }

    #[tokio::test]
    async fn falls_back_to_home_page() {
        let search = Arc::new(ScriptedSearch::always(Ok(vec![hit(
            "https://example.com/terms",
            "利用規約",
            "",
        )])));
        let result = phase(search, test_pipeline_config())
            .run(&example_request(), &PartialBundle::default())
            .await;
        let PhaseResult::Success { value, .. } = result else {
            panic!("expected success");
        };
        let pages: Vec<&str> = value.candidate_pages.iter().map(Url::as_str).collect();
        assert_eq!(pages, vec!["https://example.com/"]);
    }
}
