//! Wires storage, providers, the governor, and the queue into a running engine.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::Result;
use tracing::{info, warn};

use enricher_core::{
    BatchDispatcher, Collaborators, LocalQueue, PipelineOrchestrator, TaskConsumer, TaskQueue,
    WorkerPool,
};
use enricher_governor::RateGovernor;
use enricher_providers::{CustomSearchClient, HttpPageFetcher, OpenAiCompatClient};
use enricher_shared::{
    AppConfig, GovernorConfig, PipelineConfig, QueueConfig, validate_api_keys,
};
use enricher_storage::Storage;

/// A started engine: workers are draining the queue.
pub(crate) struct Engine {
    pub storage: Arc<Storage>,
    pub queue: Arc<LocalQueue>,
    pub dispatcher: Arc<BatchDispatcher>,
    pub queue_config: QueueConfig,
    pool: WorkerPool,
}

impl Engine {
    pub async fn start(config: &AppConfig) -> Result<Self> {
        validate_api_keys(config)?;

        let storage = Arc::new(Storage::open(Path::new(&config.storage.path)).await?);
        let governor = Arc::new(RateGovernor::with_system_clock(GovernorConfig::from(config)));
        let pipeline = PipelineConfig::from(config);

        let collaborators = Collaborators {
            search: Arc::new(CustomSearchClient::from_config(&config.search)?),
            extraction_model: Arc::new(OpenAiCompatClient::from_config(&config.extraction_model)?),
            synthesis_model: Arc::new(OpenAiCompatClient::from_config(&config.synthesis_model)?),
            pages: Arc::new(HttpPageFetcher::new(
                Duration::from_secs(config.search.timeout_secs),
                pipeline.page_max_chars,
            )?),
            store: storage.clone(),
        };

        let clock = governor.clock().clone();
        let orchestrator = Arc::new(PipelineOrchestrator::new(&pipeline, governor, collaborators));
        let queue_config = QueueConfig::from(config);
        let consumer = Arc::new(TaskConsumer::new(orchestrator, queue_config.clone()));
        let queue = Arc::new(LocalQueue::new(queue_config.clone(), storage.clone(), clock));
        let pool = WorkerPool::spawn(queue_config.workers, queue.clone(), consumer);
        let dispatcher = Arc::new(BatchDispatcher::new(queue.clone()));

        info!(
            db = %config.storage.path,
            workers = pool.size(),
            max_outstanding = queue_config.max_outstanding,
            "engine started"
        );

        Ok(Self {
            storage,
            queue,
            dispatcher,
            queue_config,
            pool,
        })
    }

    /// Let every outstanding unit settle, then stop.
    pub async fn drain(self) {
        self.queue.close();
        self.queue.wait_idle().await;
        self.pool.shutdown().await;
    }

    /// Stop accepting work and stop after in-progress deliveries settle.
    /// Units still waiting in the queue are abandoned.
    pub async fn stop(self) {
        self.queue.close();
        let abandoned = self.queue.outstanding();
        if abandoned > 0 {
            warn!(abandoned, "stopping with undelivered units");
        }
        self.pool.shutdown().await;
    }
}
