//! Maps one delivery onto an orchestrator run and a queue decision.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use enricher_shared::{EnrichmentRequest, EnrichmentStatus, QueueConfig};

use crate::orchestrator::PipelineOrchestrator;
use crate::queue::Delivery;

/// What the queue should do with a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryDecision {
    Ack,
    /// Redeliver after this delay.
    Nack(Duration),
    DeadLetter(String),
}

pub struct TaskConsumer {
    orchestrator: Arc<PipelineOrchestrator>,
    config: QueueConfig,
}

impl TaskConsumer {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>, config: QueueConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Handle one delivery. Never fails: malformed payloads are dead-lettered
    /// and every orchestrator outcome maps to a decision.
    #[instrument(skip_all, fields(delivery_id = %delivery.id, attempt = delivery.attempt))]
    pub async fn handle(&self, delivery: &Delivery) -> DeliveryDecision {
        let request: EnrichmentRequest = match serde_json::from_str(&delivery.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "undecodable delivery");
                return DeliveryDecision::DeadLetter(format!("malformed payload: {e}"));
            }
        };
        if let Err(e) = request.validate() {
            warn!(entity_id = %request.entity_id, error = %e, "invalid request");
            let reason = format!("invalid request: {e}");
            self.orchestrator.record_rejection(&request, &reason).await;
            return DeliveryDecision::DeadLetter(reason);
        }

        let outcome = self.orchestrator.run(&request).await;

        let decision = if !outcome.persisted {
            self.retry_or_give_up(delivery.attempt, None, "persistence failed")
        } else {
            match outcome.status {
                EnrichmentStatus::Ok | EnrichmentStatus::NotFound | EnrichmentStatus::ParseError => {
                    DeliveryDecision::Ack
                }
                EnrichmentStatus::RateLimited | EnrichmentStatus::Timeout => self.retry_or_give_up(
                    delivery.attempt,
                    outcome.retry_after,
                    outcome.status.as_str(),
                ),
            }
        };

        info!(
            entity_id = %request.entity_id,
            status = %outcome.status,
            decision = ?decision,
            "delivery handled"
        );
        decision
    }

    fn retry_or_give_up(&self, attempt: u32, hint: Option<Duration>, cause: &str) -> DeliveryDecision {
        if attempt >= self.config.max_deliveries {
            return DeliveryDecision::DeadLetter(format!("{cause} after {attempt} deliveries"));
        }
        DeliveryDecision::Nack(self.nack_delay(attempt, hint))
    }

    /// Requeue delay: the orchestrator's hint, or exponential from the
    /// queue's minimum, bounded to the queue's backoff range.
    pub fn nack_delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let min = self.config.min_backoff;
        let max = self.config.max_backoff.max(min);
        let delay = hint.unwrap_or_else(|| {
            let exponent = attempt.saturating_sub(1).min(16);
            min.saturating_mul(1 << exponent)
        });
        delay.clamp(min, max)
    }
}
