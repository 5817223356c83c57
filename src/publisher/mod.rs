//! Publisher over an asynchronous broker producer.
//!
//! [`Publisher::publish`] hands each event of a batch to the producer's send
//! path and returns as soon as the producer has accepted it. Delivery reports
//! are awaited on background tasks that count successes and failures. Nothing
//! is retried here; retries, if any, are producer configuration.
//!
//! [`Publisher::flush`] is for shutdown only: it waits until every message
//! accepted so far has been acknowledged by the broker, or the timeout passes.

pub mod kafka;

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::collector::CollectRequest;
use crate::metrics::Metrics;

/// Errors from the producer or the flush.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    #[error("producer rejected message: {0}")]
    Enqueue(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("{failed} of {total} events could not be enqueued")]
    Partial { failed: usize, total: usize },

    #[error("flush timed out with {pending} messages unacknowledged")]
    FlushTimeout { pending: usize },
}

/// One broker message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Resolves once the broker has acknowledged (or refused) a message.
pub type Delivery = BoxFuture<'static, Result<(), PublishError>>;

/// The broker producer's send path.
#[async_trait]
pub trait ProducerClient: Send + Sync {
    /// Enqueue a message. Waits while the producer's local buffer is full.
    async fn enqueue(&self, message: OutboundMessage) -> Result<Delivery, PublishError>;

    /// Wait for the producer's outstanding sends, bounded by `timeout`.
    async fn flush(&self, timeout: Duration) -> Result<(), PublishError>;
}

/// Count of messages enqueued but not yet acknowledged.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn start(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

pub struct Publisher {
    client: Arc<dyn ProducerClient>,
    in_flight: Arc<InFlight>,
    metrics: Arc<Metrics>,
}

impl Publisher {
    pub fn new(client: Arc<dyn ProducerClient>, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            in_flight: Arc::new(InFlight::default()),
            metrics,
        }
    }

    /// Messages accepted by the producer and still awaiting acknowledgement.
    pub fn pending(&self) -> usize {
        self.in_flight.get()
    }

    /// Send every event of a batch to `topic`, one message per event keyed by
    /// the connection id.
    ///
    /// Returns once all events are enqueued. An event the producer refuses is
    /// counted as a delivery failure and the rest of the batch still goes out.
    pub async fn publish(&self, topic: &str, batch: &CollectRequest) -> Result<(), PublishError> {
        let total = batch.request.events.len();
        let mut failed = 0;

        for event in &batch.request.events {
            let message = OutboundMessage {
                topic: topic.to_string(),
                key: Some(batch.identity.id.clone()),
                payload: event.event_bytes.clone(),
            };

            match self.client.enqueue(message).await {
                Ok(delivery) => self.track(delivery, topic),
                Err(e) => {
                    failed += 1;
                    Metrics::increment(&self.metrics.delivery_failures);
                    warn!(topic = %topic, error = %e, "Producer refused event");
                }
            }
        }

        debug!(
            topic = %topic,
            req_guid = %batch.request.req_guid,
            events = total,
            failed,
            "Batch handed to producer"
        );

        if failed > 0 {
            return Err(PublishError::Partial { failed, total });
        }
        Ok(())
    }

    fn track(&self, delivery: Delivery, topic: &str) {
        self.in_flight.start();
        let in_flight = self.in_flight.clone();
        let metrics = self.metrics.clone();
        let topic = topic.to_string();

        tokio::spawn(async move {
            match delivery.await {
                Ok(()) => Metrics::increment(&metrics.messages_delivered),
                Err(e) => {
                    Metrics::increment(&metrics.delivery_failures);
                    warn!(topic = %topic, error = %e, "Broker rejected message");
                }
            }
            in_flight.finish();
        });
    }

    /// Block until everything already accepted is acknowledged, or `timeout`.
    pub async fn flush(&self, timeout: Duration) -> Result<(), PublishError> {
        let deadline = tokio::time::Instant::now() + timeout;
        info!(pending = self.pending(), "Flushing publisher");

        if let Err(e) = self.client.flush(timeout).await {
            warn!(error = %e, "Producer flush reported an error");
        }

        loop {
            let idle = self.in_flight.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            let pending = self.in_flight.get();
            if pending == 0 {
                info!("Publisher flushed");
                return Ok(());
            }

            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                let pending = self.in_flight.get();
                warn!(pending, "Publisher flush timed out");
                return Err(PublishError::FlushTimeout { pending });
            }
        }
    }
}
