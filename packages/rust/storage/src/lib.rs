//! Turso Embedded / libSQL storage layer.
//!
//! The [`Storage`] struct wraps a libSQL database holding enrichment records,
//! the source list awaiting enrichment, and dead-lettered deliveries.
//!
//! **Write rules:**
//! - Successful runs replace the whole record ([`Storage::upsert_record`]).
//! - Failed runs only touch `status`, `signals`, and `last_crawled_at`
//!   ([`Storage::upsert_status`]) so earlier data is never wiped.

mod migrations;

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use enricher_shared::{
    DeadLetterSink, EnricherError, EnrichmentRecord, EnrichmentRequest, EnrichmentStatus,
    EntityId, RecordFields, RecordStore, Result, Signals, SourceCatalog,
};

/// Columns of `enrichment_records`, in [`row_to_record`] order.
const RECORD_COLUMNS: &str = "entity_id, name_legal, industry, hq_address_raw, prefecture_name, \
     overview_text, services_text, products_text, pain_hypotheses, personalization_notes, \
     employee_count, employee_count_source_url, last_crawled_at, status, signals";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// Per-industry progress, as reported by `enricher stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndustryStats {
    pub industry: String,
    pub total: u64,
    pub completed: u64,
    pub completion_rate: f64,
    pub avg_hypotheses: f64,
    pub missing_employees: u64,
}

/// Outcome of a JSONL source import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
}

/// A dead-lettered delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetter {
    pub id: String,
    pub entity_id: Option<String>,
    pub payload: String,
    pub reason: String,
    pub attempts: u32,
    pub created_at: String,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EnricherError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| EnricherError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| EnricherError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (for `stats`).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| EnricherError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| EnricherError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        EnricherError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0,
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(EnricherError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Enrichment records
    // -----------------------------------------------------------------------

    /// Insert or fully replace a record.
    pub async fn upsert_record(&self, record: &EnrichmentRecord) -> Result<()> {
        self.check_writable()?;
        let f = &record.fields;
        let hypotheses = encode_json(&f.pain_hypotheses)?;
        let signals = encode_json(&record.signals)?;
        self.conn
            .execute(
                "INSERT INTO enrichment_records (
                   entity_id, name_legal, industry, hq_address_raw, prefecture_name,
                   overview_text, services_text, products_text, pain_hypotheses,
                   personalization_notes, employee_count, employee_count_source_url,
                   last_crawled_at, status, signals)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(entity_id) DO UPDATE SET
                   name_legal = excluded.name_legal,
                   industry = excluded.industry,
                   hq_address_raw = excluded.hq_address_raw,
                   prefecture_name = excluded.prefecture_name,
                   overview_text = excluded.overview_text,
                   services_text = excluded.services_text,
                   products_text = excluded.products_text,
                   pain_hypotheses = excluded.pain_hypotheses,
                   personalization_notes = excluded.personalization_notes,
                   employee_count = excluded.employee_count,
                   employee_count_source_url = excluded.employee_count_source_url,
                   last_crawled_at = excluded.last_crawled_at,
                   status = excluded.status,
                   signals = excluded.signals",
                params![
                    record.entity_id.as_str(),
                    f.name_legal.as_deref(),
                    f.industry.as_deref(),
                    f.hq_address_raw.as_deref(),
                    f.prefecture_name.as_deref(),
                    f.overview_text.as_deref(),
                    f.services_text.as_deref(),
                    f.products_text.as_deref(),
                    hypotheses.as_str(),
                    f.personalization_notes.as_deref(),
                    f.employee_count.map(|n| n as i64),
                    f.employee_count_source_url.as_deref(),
                    record.last_crawled_at.to_rfc3339(),
                    record.status.as_str(),
                    signals.as_str(),
                ],
            )
            .await
            .map_err(|e| EnricherError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Insert a bare record, or update only `status`, `signals`, and
    /// `last_crawled_at` of an existing one. Enrichment fields are never written.
    pub async fn upsert_status(&self, record: &EnrichmentRecord) -> Result<()> {
        self.check_writable()?;
        let signals = encode_json(&record.signals)?;
        self.conn
            .execute(
                "INSERT INTO enrichment_records (entity_id, last_crawled_at, status, signals)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(entity_id) DO UPDATE SET
                   last_crawled_at = excluded.last_crawled_at,
                   status = excluded.status,
                   signals = excluded.signals",
                params![
                    record.entity_id.as_str(),
                    record.last_crawled_at.to_rfc3339(),
                    record.status.as_str(),
                    signals.as_str(),
                ],
            )
            .await
            .map_err(|e| EnricherError::Storage(e.to_string()))?;
        Ok(())
    }

    pub async fn get_record(&self, entity_id: &EntityId) -> Result<Option<EnrichmentRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {RECORD_COLUMNS} FROM enrichment_records WHERE entity_id = ?1"),
                params![entity_id.as_str()],
            )
            .await
            .map_err(|e| EnricherError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(EnricherError::Storage(e.to_string())),
        }
    }

    /// Record counts per status. Statuses with no records are reported as 0.
    pub async fn count_by_status(&self) -> Result<BTreeMap<EnrichmentStatus, u64>> {
        let mut counts: BTreeMap<EnrichmentStatus, u64> =
            EnrichmentStatus::ALL.into_iter().map(|s| (s, 0)).collect();

        let mut rows = self
            .conn
            .query(
                "SELECT status, COUNT(*) FROM enrichment_records GROUP BY status",
                params![],
            )
            .await
            .map_err(|e| EnricherError::Storage(e.to_string()))?;

        while let Ok(Some(row)) = rows.next().await {
            let status: String = row
                .get(0)
                .map_err(|e| EnricherError::Storage(e.to_string()))?;
            let count: i64 = row
                .get(1)
                .map_err(|e| EnricherError::Storage(e.to_string()))?;
            match status.parse::<EnrichmentStatus>() {
                Ok(status) => {
                    counts.insert(status, count.max(0) as u64);
                }
                Err(_) => warn!(status = %status, "ignoring unknown status in store"),
            }
        }
        Ok(counts)
    }

    /// Completion statistics grouped by industry, largest first.
    pub async fn industry_stats(&self) -> Result<Vec<IndustryStats>> {
        let mut rows = self
            .conn
            .query(
                "SELECT COALESCE(r.industry, s.industry, '') AS ind,
                        COUNT(*),
                        SUM(CASE WHEN r.status = 'ok' THEN 1 ELSE 0 END),
                        AVG(json_array_length(r.pain_hypotheses)),
                        SUM(CASE WHEN r.employee_count IS NULL THEN 1 ELSE 0 END)
                 FROM enrichment_records r
                 LEFT JOIN sources s ON s.entity_id = r.entity_id
                 GROUP BY ind
                 ORDER BY COUNT(*) DESC, ind",
                params![],
            )
            .await
            .map_err(|e| EnricherError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let industry: String = row
                .get(0)
                .map_err(|e| EnricherError::Storage(e.to_string()))?;
            let total = row.get::<i64>(1).unwrap_or(0).max(0) as u64;
            let completed = row.get::<i64>(2).unwrap_or(0).max(0) as u64;
            let avg_hypotheses = row.get::<f64>(3).unwrap_or(0.0);
            let missing_employees = row.get::<i64>(4).unwrap_or(0).max(0) as u64;
            let completion_rate = if total == 0 {
                0.0
            } else {
                round2(completed as f64 / total as f64 * 100.0)
            };
            results.push(IndustryStats {
                industry,
                total,
                completed,
                completion_rate,
                avg_hypotheses: round2(avg_hypotheses),
                missing_employees,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Sources
    // -----------------------------------------------------------------------

    /// Insert or refresh a source entity.
    pub async fn upsert_source(&self, request: &EnrichmentRequest) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO sources (entity_id, name, industry, prefecture, inquiry_url, notes, imported_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(entity_id) DO UPDATE SET
                   name = excluded.name,
                   industry = excluded.industry,
                   prefecture = excluded.prefecture,
                   inquiry_url = excluded.inquiry_url,
                   notes = excluded.notes",
                params![
                    request.entity_id.as_str(),
                    request.name.as_str(),
                    request.industry.as_str(),
                    request.prefecture.as_deref(),
                    request.inquiry_url.as_deref(),
                    request.notes.as_deref(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| EnricherError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Import sources from a JSON Lines file of request objects.
    ///
    /// Lines that fail to parse or validate are skipped and logged.
    pub async fn import_sources_jsonl(&self, path: &Path) -> Result<ImportReport> {
        self.check_writable()?;
        let content = std::fs::read_to_string(path).map_err(|e| EnricherError::io(path, e))?;

        let mut report = ImportReport::default();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let request = serde_json::from_str::<EnrichmentRequest>(line)
                .map_err(|e| EnricherError::parse(e.to_string()))
                .and_then(|req| req.validate().map(|()| req));
            match request {
                Ok(req) => {
                    self.upsert_source(&req).await?;
                    report.imported += 1;
                }
                Err(e) => {
                    warn!(line = line_no + 1, error = %e, "skipping source line");
                    report.skipped += 1;
                }
            }
        }

        info!(imported = report.imported, skipped = report.skipped, "sources imported");
        Ok(report)
    }

    /// Sources without an `ok` record, oldest import first.
    pub async fn pending_sources(
        &self,
        industry: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EnrichmentRequest>> {
        let mut rows = self
            .conn
            .query(
                "SELECT s.entity_id, s.name, s.industry, s.prefecture, s.inquiry_url, s.notes
                 FROM sources s
                 LEFT JOIN enrichment_records r ON r.entity_id = s.entity_id
                 WHERE (r.status IS NULL OR r.status != 'ok')
                   AND (?1 IS NULL OR s.industry = ?1)
                 ORDER BY s.imported_at, s.entity_id
                 LIMIT ?2",
                params![industry, limit as i64],
            )
            .await
            .map_err(|e| EnricherError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let entity_id: String = row
                .get(0)
                .map_err(|e| EnricherError::Storage(e.to_string()))?;
            results.push(EnrichmentRequest {
                entity_id: EntityId::from_website(&entity_id)?,
                name: row
                    .get(1)
                    .map_err(|e| EnricherError::Storage(e.to_string()))?,
                industry: row
                    .get(2)
                    .map_err(|e| EnricherError::Storage(e.to_string()))?,
                prefecture: row.get::<String>(3).ok(),
                inquiry_url: row.get::<String>(4).ok(),
                notes: row.get::<String>(5).ok(),
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Dead letters
    // -----------------------------------------------------------------------

    pub async fn insert_dead_letter(
        &self,
        entity_id: Option<&EntityId>,
        payload: &str,
        reason: &str,
        attempts: u32,
    ) -> Result<()> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO dead_letters (id, entity_id, payload, reason, attempts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.as_str(),
                    entity_id.map(EntityId::as_str),
                    payload,
                    reason,
                    i64::from(attempts),
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| EnricherError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Most recent dead letters first.
    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, entity_id, payload, reason, attempts, created_at FROM dead_letters
                 ORDER BY created_at DESC, id DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| EnricherError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(DeadLetter {
                id: row
                    .get(0)
                    .map_err(|e| EnricherError::Storage(e.to_string()))?,
                entity_id: row.get::<String>(1).ok(),
                payload: row
                    .get(2)
                    .map_err(|e| EnricherError::Storage(e.to_string()))?,
                reason: row
                    .get(3)
                    .map_err(|e| EnricherError::Storage(e.to_string()))?,
                attempts: row.get::<i64>(4).unwrap_or(0).max(0) as u32,
                created_at: row
                    .get(5)
                    .map_err(|e| EnricherError::Storage(e.to_string()))?,
            });
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Port implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl RecordStore for Storage {
    async fn get_record(&self, entity_id: &EntityId) -> Result<Option<EnrichmentRecord>> {
        Storage::get_record(self, entity_id).await
    }

    async fn upsert_record(&self, record: &EnrichmentRecord) -> Result<()> {
        Storage::upsert_record(self, record).await
    }

    async fn upsert_status(&self, record: &EnrichmentRecord) -> Result<()> {
        Storage::upsert_status(self, record).await
    }
}

#[async_trait]
impl SourceCatalog for Storage {
    async fn pending_sources(
        &self,
        industry: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EnrichmentRequest>> {
        Storage::pending_sources(self, industry, limit).await
    }
}

#[async_trait]
impl DeadLetterSink for Storage {
    async fn record_dead_letter(
        &self,
        entity_id: Option<&EntityId>,
        payload: &str,
        reason: &str,
        attempts: u32,
    ) -> Result<()> {
        self.insert_dead_letter(entity_id, payload, reason, attempts)
            .await
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn encode_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| EnricherError::Storage(e.to_string()))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Convert a database row selected with [`RECORD_COLUMNS`].
fn row_to_record(row: &libsql::Row) -> Result<EnrichmentRecord> {
    let entity_id: String = row
        .get(0)
        .map_err(|e| EnricherError::Storage(e.to_string()))?;
    let hypotheses: String = row.get(8).unwrap_or_else(|_| "[]".into());
    let last_crawled_at: String = row
        .get(12)
        .map_err(|e| EnricherError::Storage(e.to_string()))?;
    let status: String = row
        .get(13)
        .map_err(|e| EnricherError::Storage(e.to_string()))?;
    let signals: String = row.get(14).unwrap_or_else(|_| "{}".into());

    Ok(EnrichmentRecord {
        entity_id: EntityId::from_website(&entity_id)?,
        fields: RecordFields {
            name_legal: row.get::<String>(1).ok(),
            industry: row.get::<String>(2).ok(),
            hq_address_raw: row.get::<String>(3).ok(),
            prefecture_name: row.get::<String>(4).ok(),
            overview_text: row.get::<String>(5).ok(),
            services_text: row.get::<String>(6).ok(),
            products_text: row.get::<String>(7).ok(),
            pain_hypotheses: serde_json::from_str(&hypotheses)
                .map_err(|e| EnricherError::Storage(format!("invalid pain_hypotheses: {e}")))?,
            personalization_notes: row.get::<String>(9).ok(),
            employee_count: row.get::<i64>(10).ok().map(|n| n.max(0) as u64),
            employee_count_source_url: row.get::<String>(11).ok(),
        },
        last_crawled_at: DateTime::parse_from_rfc3339(&last_crawled_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| EnricherError::Storage(format!("invalid date: {e}")))?,
        status: status.parse()?,
        signals: serde_json::from_str::<Signals>(&signals)
            .map_err(|e| EnricherError::Storage(format!("invalid signals: {e}")))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("enricher_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn request(website: &str, industry: &str) -> EnrichmentRequest {
        EnrichmentRequest {
            entity_id: EntityId::from_website(website).unwrap(),
            name: format!("{website} 株式会社"),
            industry: industry.into(),
            prefecture: None,
            inquiry_url: None,
            notes: None,
        }
    }

    fn ok_record(website: &str) -> EnrichmentRecord {
        let mut signals = Signals::new();
        signals.insert("source_urls".into(), json!(["https://example.com/company"]));
        EnrichmentRecord {
            entity_id: EntityId::from_website(website).unwrap(),
            fields: RecordFields {
                name_legal: Some("株式会社サンプル".into()),
                industry: Some("IT・web".into()),
                hq_address_raw: Some("東京都渋谷区渋谷2-21-1".into()),
                prefecture_name: Some("東京都".into()),
                overview_text: Some("概要".into()),
                pain_hypotheses: vec!["採用".into(), "DX".into(), "営業".into()],
                employee_count: Some(120),
                ..Default::default()
            },
            last_crawled_at: Utc::now(),
            status: EnrichmentStatus::Ok,
            signals,
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("enricher_test_{}.db", Uuid::now_v7()));
        let first = Storage::open(&tmp).await.expect("first open");
        drop(first);
        let second = Storage::open(&tmp).await.expect("second open");
        assert_eq!(second.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn record_round_trip() {
        let storage = test_storage().await;
        let record = ok_record("example.com");
        storage.upsert_record(&record).await.expect("upsert");

        let found = storage
            .get_record(&record.entity_id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(found.fields, record.fields);
        assert_eq!(found.status, EnrichmentStatus::Ok);
        assert_eq!(found.signals["source_urls"][0], "https://example.com/company");

        let missing = EntityId::from_website("absent.example.org").unwrap();
        assert!(storage.get_record(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_upsert_preserves_existing_fields() {
        let storage = test_storage().await;
        let record = ok_record("example.com");
        storage.upsert_record(&record).await.unwrap();

        let mut signals = Signals::new();
        signals.insert("error_kind".into(), json!("timeout"));
        let failure = EnrichmentRecord {
            entity_id: record.entity_id.clone(),
            fields: RecordFields::default(),
            last_crawled_at: Utc::now(),
            status: EnrichmentStatus::Timeout,
            signals,
        };
        storage.upsert_status(&failure).await.unwrap();

        let found = storage.get_record(&record.entity_id).await.unwrap().unwrap();
        assert_eq!(found.status, EnrichmentStatus::Timeout);
        assert_eq!(found.fields.hq_address_raw, record.fields.hq_address_raw);
        assert_eq!(found.fields.pain_hypotheses.len(), 3);
        assert_eq!(found.signals["error_kind"], "timeout");
    }

    #[tokio::test]
    async fn status_upsert_inserts_new_rows() {
        let storage = test_storage().await;
        let failure = EnrichmentRecord {
            entity_id: EntityId::from_website("new.example.com").unwrap(),
            fields: RecordFields {
                industry: Some("製造業界".into()),
                ..Default::default()
            },
            last_crawled_at: Utc::now(),
            status: EnrichmentStatus::NotFound,
            signals: Signals::new(),
        };
        storage.upsert_status(&failure).await.unwrap();

        let found = storage.get_record(&failure.entity_id).await.unwrap().unwrap();
        assert_eq!(found.status, EnrichmentStatus::NotFound);
        assert!(found.fields.is_empty());
    }

    #[tokio::test]
    async fn counts_and_industry_stats() {
        let storage = test_storage().await;
        storage.upsert_record(&ok_record("a.example.com")).await.unwrap();
        storage.upsert_record(&ok_record("b.example.com")).await.unwrap();
        storage.upsert_source(&request("c.example.com", "IT・web")).await.unwrap();
        let mut failed = ok_record("c.example.com");
        failed.status = EnrichmentStatus::RateLimited;
        storage.upsert_status(&failed).await.unwrap();

        let counts = storage.count_by_status().await.unwrap();
        assert_eq!(counts[&EnrichmentStatus::Ok], 2);
        assert_eq!(counts[&EnrichmentStatus::RateLimited], 1);
        assert_eq!(counts[&EnrichmentStatus::ParseError], 0);

        let stats = storage.industry_stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].industry, "IT・web");
        assert_eq!(stats[0].total, 3);
        assert_eq!(stats[0].completed, 2);
        assert_eq!(stats[0].completion_rate, 66.67);
        assert_eq!(stats[0].avg_hypotheses, 2.0);
        assert_eq!(stats[0].missing_employees, 1);
    }

    #[tokio::test]
    async fn pending_sources_skip_ok_records() {
        let storage = test_storage().await;
        storage.upsert_source(&request("a.example.com", "IT・web")).await.unwrap();
        storage.upsert_source(&request("b.example.com", "IT・web")).await.unwrap();
        storage.upsert_source(&request("c.example.com", "製造業界")).await.unwrap();
        storage.upsert_record(&ok_record("a.example.com")).await.unwrap();

        let pending = storage.pending_sources(None, 10).await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|r| r.entity_id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&"https://a.example.com"));

        let it = storage.pending_sources(Some("IT・web"), 10).await.unwrap();
        assert_eq!(it.len(), 1);
        assert_eq!(it[0].entity_id.as_str(), "https://b.example.com");

        assert_eq!(storage.pending_sources(None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn jsonl_import_skips_bad_lines() {
        let storage = test_storage().await;
        let path = std::env::temp_dir().join(format!("enricher_sources_{}.jsonl", Uuid::now_v7()));
        std::fs::write(
            &path,
            concat!(
                r#"{"website":"example.co.jp","name":"株式会社サンプル","industry":"IT・web","prefecture":"東京都"}"#,
                "\n",
                "not json\n",
                "\n",
                r#"{"website":"other.example.com","name":"<script>","industry":"IT・web"}"#,
                "\n",
            ),
        )
        .unwrap();

        let report = storage.import_sources_jsonl(&path).await.unwrap();
        assert_eq!(report, ImportReport { imported: 1, skipped: 2 });

        let pending = storage.pending_sources(None, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].prefecture.as_deref(), Some("東京都"));
    }

    #[tokio::test]
    async fn dead_letters_are_listed() {
        let storage = test_storage().await;
        storage
            .insert_dead_letter(None, r#"{"bad":true}"#, "malformed payload", 1)
            .await
            .unwrap();
        let entity = EntityId::from_website("example.com").unwrap();
        storage
            .insert_dead_letter(Some(&entity), "{}", "delivery attempts exhausted", 5)
            .await
            .unwrap();
        let letters = storage.list_dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 2);
        let bad = letters.iter().find(|l| l.entity_id.is_none()).unwrap();
        assert_eq!(bad.reason, "malformed payload");
        assert_eq!(bad.attempts, 1);
        assert!(letters.iter().any(|l| l.entity_id.as_deref() == Some("https://example.com")));
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("enricher_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.upsert_record(&ok_record("example.com")).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let result = ro.upsert_record(&ok_record("other.example.com")).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
        assert_eq!(ro.count_by_status().await.unwrap()[&EnrichmentStatus::Ok], 1);
    }
}
