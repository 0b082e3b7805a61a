//! In-process task queue with at-least-once delivery.
//!
//! [`LocalQueue`] stands in for the hosted task queue: it counts delivery
//! attempts, redelivers a nacked unit after its delay, dead-letters once
//! `max_deliveries` is reached, and suppresses a second publish of an entity
//! that is still in flight. Settlements are broadcast on a watch channel so
//! the dispatcher can apply backpressure.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};
use uuid::Uuid;

use enricher_governor::Clock;
use enricher_shared::{
    DeadLetterSink, EnricherError, EnrichmentRequest, EntityId, QueueConfig, Result,
};

use crate::consumer::DeliveryDecision;

/// One unit of work as seen by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: Uuid,
    /// Serialized [`EnrichmentRequest`].
    pub payload: String,
    /// 1 on first delivery.
    pub attempt: u32,
    /// Decoded from the payload when possible.
    pub entity_id: Option<EntityId>,
    dedup_key: String,
}

impl Delivery {
    pub fn new(payload: String, attempt: u32) -> Self {
        let entity_id = serde_json::from_str::<EnrichmentRequest>(&payload)
            .ok()
            .map(|r| r.entity_id);
        let dedup_key = dedup_key(entity_id.as_ref().map_or(payload.as_str(), EntityId::as_str));
        Self {
            id: Uuid::now_v7(),
            payload,
            attempt,
            entity_id,
            dedup_key,
        }
    }

    fn redelivery(self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self
        }
    }
}

/// Result of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Published {
    Enqueued,
    /// The entity is already in flight; nothing was enqueued.
    Duplicate,
}

/// The publishing side of a task queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn publish(&self, request: &EnrichmentRequest) -> Result<Published>;

    /// Units published but not yet acknowledged or dead-lettered.
    fn outstanding(&self) -> usize;

    /// Ticks once per settled unit.
    fn settlements(&self) -> watch::Receiver<u64>;
}

pub struct LocalQueue {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn DeadLetterSink>,
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    in_flight: Mutex<HashSet<String>>,
    settled: watch::Sender<u64>,
    closed: AtomicBool,
}

impl LocalQueue {
    pub fn new(config: QueueConfig, sink: Arc<dyn DeadLetterSink>, clock: Arc<dyn Clock>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (settled, _) = watch::channel(0);
        Self {
            config,
            clock,
            sink,
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            in_flight: Mutex::new(HashSet::new()),
            settled,
            closed: AtomicBool::new(false),
        }
    }

    /// Publish a raw payload.
    pub fn publish_payload(&self, payload: String) -> Result<Published> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EnricherError::Queue("queue is closed".into()));
        }
        let delivery = Delivery::new(payload, 1);
        if !self.in_flight().insert(delivery.dedup_key.clone()) {
            debug!(entity_id = ?delivery.entity_id, "already in flight");
            return Ok(Published::Duplicate);
        }
        let key = delivery.dedup_key.clone();
        if self.sender.send(delivery).is_err() {
            self.in_flight().remove(&key);
            return Err(EnricherError::Queue("queue receiver dropped".into()));
        }
        Ok(Published::Enqueued)
    }

    /// Next delivery. Waits while the queue is empty.
    pub async fn receive(&self) -> Option<Delivery> {
        self.receiver.lock().await.recv().await
    }

    /// Apply a consumer decision to a delivery.
    pub async fn settle(&self, delivery: Delivery, decision: &DeliveryDecision) {
        match decision {
            DeliveryDecision::Ack => self.complete(&delivery),
            DeliveryDecision::Nack(_) if delivery.attempt >= self.config.max_deliveries => {
                self.dead_letter(delivery, "delivery attempts exhausted").await;
            }
            DeliveryDecision::Nack(delay) => {
                let delay = *delay;
                let next = delivery.redelivery();
                let sender = self.sender.clone();
                let clock = self.clock.clone();
                debug!(
                    entity_id = ?next.entity_id,
                    attempt = next.attempt,
                    retry_after_ms = delay.as_millis() as u64,
                    "scheduling redelivery"
                );
                tokio::spawn(async move {
                    clock.sleep(delay).await;
                    if sender.send(next).is_err() {
                        warn!("queue dropped before redelivery");
                    }
                });
            }
            DeliveryDecision::DeadLetter(reason) => self.dead_letter(delivery, reason).await,
        }
    }

    /// Stop accepting publishes. Deliveries already queued still drain.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until nothing is outstanding.
    pub async fn wait_idle(&self) {
        let mut settled = self.settled.subscribe();
        while self.outstanding() > 0 {
            if settled.changed().await.is_err() {
                break;
            }
        }
    }

    async fn dead_letter(&self, delivery: Delivery, reason: &str) {
        warn!(
            entity_id = ?delivery.entity_id,
            attempt = delivery.attempt,
            reason,
            "dead-lettering delivery"
        );
        if let Err(e) = self
            .sink
            .record_dead_letter(
                delivery.entity_id.as_ref(),
                &delivery.payload,
                reason,
                delivery.attempt,
            )
            .await
        {
            error!(error = %e, "failed to record dead letter");
        }
        self.complete(&delivery);
    }

    fn complete(&self, delivery: &Delivery) {
        self.in_flight().remove(&delivery.dedup_key);
        self.settled.send_modify(|count| *count += 1);
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TaskQueue for LocalQueue {
    async fn publish(&self, request: &EnrichmentRequest) -> Result<Published> {
        let payload = serde_json::to_string(request)
            .map_err(|e| EnricherError::Queue(format!("failed to encode request: {e}")))?;
        self.publish_payload(payload)
    }

    fn outstanding(&self) -> usize {
        self.in_flight().len()
    }

    fn settlements(&self) -> watch::Receiver<u64> {
        self.settled.subscribe()
    }
}

/// Hex SHA-256 of the entity key.
fn dedup_key(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}
