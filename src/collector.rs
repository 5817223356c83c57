//! Hand-off from ingestion handlers to the worker pool.
//!
//! Handlers only ever see the [`Collector`] trait. The production collector is
//! a [`ChannelCollector`] over a bounded channel: when the channel is full,
//! `collect` waits, which stalls the calling read loop or request. That wait
//! is the gateway's admission control.

use async_trait::async_trait;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::codec::EventRequest;
use crate::connection::ConnectionIdentity;

/// A decoded batch waiting to be published. Consumed by exactly one worker.
#[derive(Debug, Clone)]
pub struct CollectRequest {
    pub identity: ConnectionIdentity,
    /// When the batch was read off the transport
    pub received_at: Instant,
    pub request: EventRequest,
}

impl CollectRequest {
    pub fn new(identity: ConnectionIdentity, request: EventRequest) -> Self {
        Self {
            identity,
            received_at: Instant::now(),
            request,
        }
    }

    pub fn group(&self) -> &str {
        &self.identity.group
    }
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("hand-off channel closed")]
    Closed,
}

#[async_trait]
pub trait Collector: Send + Sync {
    async fn collect(&self, request: CollectRequest) -> Result<(), CollectError>;
}

/// Collector backed by the bounded hand-off channel.
#[derive(Clone)]
pub struct ChannelCollector {
    sender: mpsc::Sender<CollectRequest>,
}

impl ChannelCollector {
    pub fn new(sender: mpsc::Sender<CollectRequest>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl Collector for ChannelCollector {
    async fn collect(&self, request: CollectRequest) -> Result<(), CollectError> {
        self.sender
            .send(request)
            .await
            .map_err(|_| CollectError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(guid: &str) -> CollectRequest {
        CollectRequest::new(
            ConnectionIdentity::new("user", "group"),
            EventRequest {
                req_guid: guid.to_string(),
                sent_time: None,
                events: vec![],
            },
        )
    }

    #[tokio::test]
    async fn test_collect_is_fifo() {
        let (tx, mut rx) = mpsc::channel(4);
        let collector = ChannelCollector::new(tx);

        collector.collect(request("1")).await.unwrap();
        collector.collect(request("2")).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().request.req_guid, "1");
        assert_eq!(rx.recv().await.unwrap().request.req_guid, "2");
    }

    #[tokio::test]
    async fn test_collect_blocks_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let collector = ChannelCollector::new(tx);
        collector.collect(request("1")).await.unwrap();

        let blocked =
            tokio::time::timeout(Duration::from_millis(20), collector.collect(request("2"))).await;
        assert!(blocked.is_err());

        rx.recv().await.unwrap();
        collector.collect(request("3")).await.unwrap();
    }

    #[tokio::test]
    async fn test_collect_fails_after_close() {
        let (tx, mut rx) = mpsc::channel(1);
        let collector = ChannelCollector::new(tx);
        rx.close();

        assert!(matches!(
            collector.collect(request("1")).await,
            Err(CollectError::Closed)
        ));
    }
}
