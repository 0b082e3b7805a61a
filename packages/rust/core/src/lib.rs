//! Task-processing engine: phase runners, the per-entity orchestrator, the
//! task consumer, and batch dispatch over a local queue.

pub mod consumer;
pub mod dispatcher;
pub mod merge;
pub mod orchestrator;
pub mod phases;
pub mod queue;
pub mod retry;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use consumer::{DeliveryDecision, TaskConsumer};
pub use dispatcher::{BatchDispatcher, DispatchReport};
pub use orchestrator::{Collaborators, Outcome, PipelineOrchestrator};
pub use phases::{Fatal, Phase, PhaseResult};
pub use queue::{Delivery, LocalQueue, Published, TaskQueue};
pub use retry::RetryPolicy;
pub use worker::WorkerPool;
