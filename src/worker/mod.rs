//! Worker pool - drains the hand-off channel into the publisher.
//!
//! Workers share the receiving end of the bounded channel. Each batch is
//! taken by exactly one worker, which resolves the topic for the batch's
//! group and hands the events to the [`Publisher`].
//!
//! ```text
//! ChannelCollector ──► [ bounded channel ] ──► worker 1..N ──► TopicRouter ──► Publisher
//! ```
//!
//! A batch whose topic cannot be resolved is dropped, logged and counted.
//! Once a batch is accepted by the channel the client has already been told
//! OK, so downstream failures never reach it.
//!
//! [`WorkerPool::flush`] closes the channel, lets the workers finish what is
//! already queued, then flushes the publisher.

pub mod router;

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collector::CollectRequest;
use crate::metrics::Metrics;
use crate::publisher::{PublishError, Publisher};

pub use router::{RouterError, TopicAdmin, TopicRouter};

type Queue = Arc<Mutex<mpsc::Receiver<CollectRequest>>>;

pub struct WorkerPool {
    size: usize,
    queue: Queue,
    router: Arc<TopicRouter>,
    publisher: Arc<Publisher>,
    metrics: Arc<Metrics>,
    stop: watch::Sender<bool>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        size: usize,
        receiver: mpsc::Receiver<CollectRequest>,
        router: Arc<TopicRouter>,
        publisher: Arc<Publisher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            size: size.max(1),
            queue: Arc::new(Mutex::new(receiver)),
            router,
            publisher,
            metrics,
            stop,
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Spawn the workers.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        for worker_id in 0..self.size {
            handles.push(tokio::spawn(run_worker(
                worker_id,
                self.queue.clone(),
                self.stop.subscribe(),
                self.router.clone(),
                self.publisher.clone(),
                self.metrics.clone(),
            )));
        }
        info!(workers = self.size, "Worker pool started");
    }

    /// Stop accepting batches, process everything still queued and wait for
    /// the publisher to confirm delivery, all within `timeout`.
    pub async fn flush(&self, timeout: Duration) -> Result<(), PublishError> {
        let deadline = tokio::time::Instant::now() + timeout;
        info!("Flushing worker pool");

        self.stop.send_replace(true);
        let handles = std::mem::take(&mut *self.handles.lock());

        match tokio::time::timeout_at(deadline, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Worker task failed");
                    }
                }
            }
            Err(_) => warn!("Workers still busy at flush deadline"),
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        self.publisher.flush(remaining).await
    }
}

async fn run_worker(
    worker_id: usize,
    queue: Queue,
    mut stop: watch::Receiver<bool>,
    router: Arc<TopicRouter>,
    publisher: Arc<Publisher>,
    metrics: Arc<Metrics>,
) {
    debug!(worker_id, "Worker started");

    loop {
        let next = {
            let mut rx = queue.lock().await;
            tokio::select! {
                biased;
                batch = rx.recv() => batch,
                _ = stopped(&mut stop) => {
                    // drain: no new sends, queued batches still come out
                    rx.close();
                    rx.recv().await
                }
            }
        };

        let Some(batch) = next else { break };
        process(worker_id, batch, &router, &publisher, &metrics).await;
    }

    debug!(worker_id, "Worker stopped");
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn process(
    worker_id: usize,
    batch: CollectRequest,
    router: &TopicRouter,
    publisher: &Publisher,
    metrics: &Metrics,
) {
    let topic = match router.get_topic(batch.group()).await {
        Ok(topic) => topic,
        Err(e) => {
            Metrics::increment(&metrics.topic_resolution_failures);
            Metrics::increment(&metrics.batches_dropped);
            warn!(
                worker_id,
                conn_group = %batch.group(),
                req_guid = %batch.request.req_guid,
                events = batch.request.events.len(),
                error = %e,
                "Dropping batch, topic unavailable"
            );
            return;
        }
    };

    if let Err(e) = publisher.publish(&topic, &batch).await {
        warn!(
            worker_id,
            topic = %topic,
            req_guid = %batch.request.req_guid,
            error = %e,
            "Batch partially published"
        );
    }

    debug!(
        worker_id,
        topic = %topic,
        queued_ms = batch.received_at.elapsed().as_millis() as u64,
        "Batch processed"
    );
}
