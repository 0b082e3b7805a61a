//! The per-run record draft and its fill-gaps-only merge rule.
//!
//! A phase may fill a field that is still empty, or append to
//! `pain_hypotheses` and `signals`. It never replaces a populated field: a
//! differing value is dropped and noted in `signals.merge_conflicts`.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use enricher_shared::{
    EnrichmentRecord, EnrichmentStatus, EntityId, MAX_PAIN_HYPOTHESES, RecordFields, Signals,
};

use crate::phases::Phase;

#[derive(Debug, Clone, Default)]
pub struct Draft {
    fields: RecordFields,
    signals: Signals,
    conflicts: Vec<Value>,
}

impl Draft {
    /// Start a draft, seeded from the persisted record unless it is `ok`.
    ///
    /// A non-`ok` record holds content from an earlier run worth keeping; an
    /// `ok` record is replaced wholesale by the next success. Overview,
    /// hypotheses, and notes are never seeded; only this run's validated
    /// synthesis fills them.
    pub fn seeded(persisted: Option<&EnrichmentRecord>) -> Self {
        let fields = persisted
            .filter(|r| r.status != EnrichmentStatus::Ok)
            .map(|r| RecordFields {
                overview_text: None,
                pain_hypotheses: Vec::new(),
                personalization_notes: None,
                ..r.fields.clone()
            })
            .unwrap_or_default();
        Self {
            fields,
            ..Self::default()
        }
    }

    pub fn fields(&self) -> &RecordFields {
        &self.fields
    }

    pub fn signals_mut(&mut self) -> &mut Signals {
        &mut self.signals
    }

    /// Merge one phase's fields into the draft.
    pub fn merge(&mut self, phase: Phase, incoming: RecordFields) {
        let RecordFields {
            name_legal,
            industry,
            hq_address_raw,
            prefecture_name,
            overview_text,
            services_text,
            products_text,
            pain_hypotheses,
            personalization_notes,
            employee_count,
            employee_count_source_url,
        } = incoming;

        let f = &mut self.fields;
        let c = &mut self.conflicts;
        fill(c, phase, "name_legal", &mut f.name_legal, name_legal);
        fill(c, phase, "industry", &mut f.industry, industry);
        fill(c, phase, "hq_address_raw", &mut f.hq_address_raw, hq_address_raw);
        fill(c, phase, "prefecture_name", &mut f.prefecture_name, prefecture_name);
        fill(c, phase, "overview_text", &mut f.overview_text, overview_text);
        fill(c, phase, "services_text", &mut f.services_text, services_text);
        fill(c, phase, "products_text", &mut f.products_text, products_text);
        fill(
            c,
            phase,
            "personalization_notes",
            &mut f.personalization_notes,
            personalization_notes,
        );

        // Headcount and its source travel together.
        match (f.employee_count, employee_count) {
            (None, Some(count)) => {
                f.employee_count = Some(count);
                f.employee_count_source_url = employee_count_source_url;
            }
            (Some(kept), Some(offered)) if kept != offered => {
                c.push(json!({"field": "employee_count", "phase": phase.as_str(), "offered": offered}));
            }
            _ => {}
        }

        for hypothesis in pain_hypotheses {
            if f.pain_hypotheses.len() >= MAX_PAIN_HYPOTHESES {
                break;
            }
            if !f.pain_hypotheses.contains(&hypothesis) {
                f.pain_hypotheses.push(hypothesis);
            }
        }
    }

    /// Append a phase's diagnostics. Keys already present keep their value.
    pub fn merge_signals(&mut self, signals: Signals) {
        for (key, value) in signals {
            self.signals.entry(key).or_insert(value);
        }
    }

    /// Finish the draft as a record with the given terminal status.
    pub fn into_record(
        self,
        entity_id: EntityId,
        status: EnrichmentStatus,
        now: DateTime<Utc>,
    ) -> EnrichmentRecord {
        let mut signals = self.signals;
        if !self.conflicts.is_empty() {
            signals.insert("merge_conflicts".into(), Value::Array(self.conflicts));
        }
        EnrichmentRecord {
            entity_id,
            fields: self.fields,
            last_crawled_at: now,
            status,
            signals,
        }
    }
}

fn fill(
    conflicts: &mut Vec<Value>,
    phase: Phase,
    name: &str,
    slot: &mut Option<String>,
    incoming: Option<String>,
) {
    let Some(value) = incoming.filter(|v| !v.trim().is_empty()) else {
        return;
    };
    let occupied = slot.as_deref().is_some_and(|v| !v.trim().is_empty());
    if !occupied {
        *slot = Some(value);
    } else if slot.as_deref() != Some(value.as_str()) {
        conflicts.push(json!({"field": name, "phase": phase.as_str(), "offered": value}));
    }
}
