//! In-memory broker doubles for unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::publisher::{Delivery, OutboundMessage, ProducerClient, PublishError};
use crate::worker::router::{RouterError, TopicAdmin};

#[derive(Clone, Copy)]
enum ProducerMode {
    Deliver,
    FailDelivery,
    Reject,
}

pub struct MockProducer {
    mode: ProducerMode,
    delivery_delay: Duration,
    sent: Mutex<Vec<OutboundMessage>>,
}

impl MockProducer {
    pub fn new() -> Self {
        Self::build(ProducerMode::Deliver, Duration::ZERO)
    }

    pub fn with_delivery_delay(delay: Duration) -> Self {
        Self::build(ProducerMode::Deliver, delay)
    }

    pub fn failing_delivery() -> Self {
        Self::build(ProducerMode::FailDelivery, Duration::ZERO)
    }

    pub fn rejecting() -> Self {
        Self::build(ProducerMode::Reject, Duration::ZERO)
    }

    fn build(mode: ProducerMode, delivery_delay: Duration) -> Self {
        Self {
            mode,
            delivery_delay,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ProducerClient for MockProducer {
    async fn enqueue(&self, message: OutboundMessage) -> Result<Delivery, PublishError> {
        if let ProducerMode::Reject = self.mode {
            return Err(PublishError::Enqueue("message too large".to_string()));
        }
        self.sent.lock().push(message);

        let mode = self.mode;
        let delay = self.delivery_delay;
        Ok(Box::pin(async move {
            tokio::time::sleep(delay).await;
            match mode {
                ProducerMode::FailDelivery => {
                    Err(PublishError::Delivery("not enough replicas".to_string()))
                }
                _ => Ok(()),
            }
        }))
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Topic admin that counts creation calls and can be told to fail.
pub struct MockAdmin {
    pub created: Mutex<Vec<String>>,
    calls: AtomicUsize,
    delay: Duration,
    failures_left: AtomicUsize,
}

impl MockAdmin {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delay,
            failures_left: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` creation calls as if the broker were down.
    pub fn fail_next(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TopicAdmin for MockAdmin {
    async fn create_topic(&self, name: &str) -> Result<(), RouterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RouterError::BrokerUnreachable(
                "all brokers down".to_string(),
            ));
        }

        self.created.lock().push(name.to_string());
        Ok(())
    }
}
