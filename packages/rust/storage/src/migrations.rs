//! SQL migration definitions for the enrichment database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: enrichment_records, sources",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per entity, keyed by normalized website
CREATE TABLE IF NOT EXISTS enrichment_records (
    entity_id                 TEXT PRIMARY KEY,
    name_legal                TEXT,
    industry                  TEXT,
    hq_address_raw            TEXT,
    prefecture_name           TEXT,
    overview_text             TEXT,
    services_text             TEXT,
    products_text             TEXT,
    pain_hypotheses           TEXT NOT NULL DEFAULT '[]',
    personalization_notes     TEXT,
    employee_count            INTEGER,
    employee_count_source_url TEXT,
    last_crawled_at           TEXT NOT NULL,
    status                    TEXT NOT NULL,
    signals                   TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_records_status ON enrichment_records(status);
CREATE INDEX IF NOT EXISTS idx_records_industry ON enrichment_records(industry);

-- Entities awaiting enrichment
CREATE TABLE IF NOT EXISTS sources (
    entity_id   TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    industry    TEXT NOT NULL,
    prefecture  TEXT,
    inquiry_url TEXT,
    notes       TEXT,
    imported_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sources_industry ON sources(industry);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Dead-lettered task deliveries",
            sql: r#"
CREATE TABLE IF NOT EXISTS dead_letters (
    id         TEXT PRIMARY KEY,
    entity_id  TEXT,
    payload    TEXT NOT NULL,
    reason     TEXT NOT NULL,
    attempts   INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_dead_letters_entity ON dead_letters(entity_id);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
