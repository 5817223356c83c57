//! Kafka implementations of the broker seams, on top of `rdkafka`.

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, info};

use super::{Delivery, OutboundMessage, ProducerClient, PublishError};
use crate::config::PublisherConfig;
use crate::worker::router::{RouterError, TopicAdmin};

fn client_config(config: &PublisherConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.brokers)
        .set(
            "queue.buffering.max.messages",
            config.queue_size.to_string(),
        );
    for (key, value) in &config.properties {
        client.set(key, value);
    }
    client
}

/// Producer half. Enqueue waits out a full local queue instead of failing.
pub struct KafkaProducer {
    producer: FutureProducer,
    queue_full_backoff: Duration,
}

impl KafkaProducer {
    pub fn new(config: &PublisherConfig) -> Result<Self, KafkaError> {
        let producer: FutureProducer = client_config(config).create()?;
        info!(brokers = %config.brokers, "Kafka producer created");
        Ok(Self {
            producer,
            queue_full_backoff: Duration::from_millis(config.queue_full_backoff_ms),
        })
    }
}

#[async_trait]
impl ProducerClient for KafkaProducer {
    async fn enqueue(&self, message: OutboundMessage) -> Result<Delivery, PublishError> {
        loop {
            let mut record =
                FutureRecord::<str, [u8]>::to(&message.topic).payload(&message.payload[..]);
            if let Some(key) = &message.key {
                record = record.key(key.as_str());
            }

            match self.producer.send_result(record) {
                Ok(delivery) => {
                    return Ok(Box::pin(async move {
                        match delivery.await {
                            Ok(Ok(_)) => Ok(()),
                            Ok(Err((e, _))) => Err(PublishError::Delivery(e.to_string())),
                            Err(_) => Err(PublishError::Delivery(
                                "delivery report dropped".to_string(),
                            )),
                        }
                    }));
                }
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {}
                Err((e, _)) => return Err(PublishError::Enqueue(e.to_string())),
            }

            // local queue full: this wait is the backpressure path
            debug!(topic = %message.topic, "Producer queue full, backing off");
            tokio::time::sleep(self.queue_full_backoff).await;
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), PublishError> {
        let producer = self.producer.clone();
        match tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(PublishError::Delivery(e.to_string())),
            Err(e) => Err(PublishError::Delivery(format!("flush task failed: {}", e))),
        }
    }
}

/// Admin half, used by the topic router.
pub struct KafkaTopicAdmin {
    admin: AdminClient<DefaultClientContext>,
    partitions: i32,
    replication: i32,
    timeout: Duration,
}

impl KafkaTopicAdmin {
    pub fn new(config: &PublisherConfig) -> Result<Self, KafkaError> {
        let admin: AdminClient<DefaultClientContext> = client_config(config).create()?;
        Ok(Self {
            admin,
            partitions: config.topic_partitions,
            replication: config.topic_replication_factor,
            timeout: Duration::from_millis(config.admin_timeout_ms),
        })
    }
}

#[async_trait]
impl TopicAdmin for KafkaTopicAdmin {
    async fn create_topic(&self, name: &str) -> Result<(), RouterError> {
        let topic = NewTopic::new(
            name,
            self.partitions,
            TopicReplication::Fixed(self.replication),
        );
        let options = AdminOptions::new()
            .operation_timeout(Some(Timeout::After(self.timeout)))
            .request_timeout(Some(Timeout::After(self.timeout)));

        let results = self
            .admin
            .create_topics([&topic], &options)
            .await
            .map_err(|e| RouterError::BrokerUnreachable(e.to_string()))?;

        for result in results {
            match result {
                Ok(_) => {}
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "Topic already exists");
                }
                Err((topic, code)) => {
                    return Err(RouterError::CreationRejected {
                        topic,
                        reason: code.to_string(),
                    })
                }
            }
        }
        Ok(())
    }
}
