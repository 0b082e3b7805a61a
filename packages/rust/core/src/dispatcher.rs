//! Fans a batch of entities out into units of work with backpressure.
//!
//! Emission pauses while `max_outstanding` units are unacknowledged and
//! resumes as they settle. Dispatching an entity twice is safe: in-flight
//! duplicates are suppressed by the queue and upserts are keyed by entity.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use enricher_shared::{EnricherError, EnrichmentRequest, Result, SourceCatalog};

use crate::queue::{Published, TaskQueue};

/// Counts from one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub published: usize,
    pub duplicates: usize,
    pub invalid: usize,
}

pub struct BatchDispatcher {
    queue: Arc<dyn TaskQueue>,
}

impl BatchDispatcher {
    pub fn new(queue: Arc<dyn TaskQueue>) -> Self {
        Self { queue }
    }

    /// Publish one unit per entity, never exceeding `max_outstanding`
    /// unacknowledged units.
    #[instrument(skip_all, fields(max_outstanding))]
    pub async fn dispatch<I>(&self, entities: I, max_outstanding: usize) -> Result<DispatchReport>
    where
        I: IntoIterator<Item = EnrichmentRequest>,
    {
        let ceiling = max_outstanding.max(1);
        let mut settled = self.queue.settlements();
        let mut report = DispatchReport::default();

        for request in entities {
            if let Err(e) = request.validate() {
                warn!(entity_id = %request.entity_id, error = %e, "skipping invalid entity");
                report.invalid += 1;
                continue;
            }

            settled.borrow_and_update();
            while self.queue.outstanding() >= ceiling {
                debug!(outstanding = self.queue.outstanding(), "waiting for settlements");
                settled
                    .changed()
                    .await
                    .map_err(|_| EnricherError::Queue("queue shut down during dispatch".into()))?;
            }

            match self.queue.publish(&request).await? {
                Published::Enqueued => report.published += 1,
                Published::Duplicate => report.duplicates += 1,
            }
        }

        info!(
            published = report.published,
            duplicates = report.duplicates,
            invalid = report.invalid,
            "dispatch complete"
        );
        Ok(report)
    }

    /// Dispatch pending sources, optionally for one industry.
    pub async fn dispatch_pending(
        &self,
        catalog: &dyn SourceCatalog,
        industry: Option<&str>,
        limit: usize,
        max_outstanding: usize,
    ) -> Result<DispatchReport> {
        let sources = catalog.pending_sources(industry, limit).await?;
        info!(industry = industry.unwrap_or("*"), count = sources.len(), "dispatching pending sources");
        self.dispatch(sources, max_outstanding).await
    }
}
