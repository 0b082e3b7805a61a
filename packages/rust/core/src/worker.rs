//! Worker pool draining a [`LocalQueue`] through a [`TaskConsumer`].

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::consumer::TaskConsumer;
use crate::queue::LocalQueue;

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawn `workers` tasks (at least one).
    pub fn spawn(workers: usize, queue: Arc<LocalQueue>, consumer: Arc<TaskConsumer>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let handles = (0..workers.max(1))
            .map(|worker| {
                let queue = queue.clone();
                let consumer = consumer.clone();
                let stop = shutdown.subscribe();
                tokio::spawn(work(worker, queue, consumer, stop))
            })
            .collect::<Vec<_>>();
        info!(workers = handles.len(), "worker pool started");
        Self { handles, shutdown }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop taking new deliveries and wait for in-progress ones to settle.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task failed");
            }
        }
        info!("worker pool stopped");
    }
}

async fn work(
    worker: usize,
    queue: Arc<LocalQueue>,
    consumer: Arc<TaskConsumer>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let delivery = tokio::select! {
            _ = stop.changed() => break,
            delivery = queue.receive() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        debug!(worker, delivery_id = %delivery.id, attempt = delivery.attempt, "delivery received");
        let decision = consumer.handle(&delivery).await;
        queue.settle(delivery, &decision).await;
    }
    debug!(worker, "worker exiting");
}
