#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use raccoon_gateway::collector::{CollectError, CollectRequest, Collector};
use raccoon_gateway::config::GatewayConfig;
use raccoon_gateway::connection::{Pinger, Registry, Upgrader};
use raccoon_gateway::http::{build_router, AppState};
use raccoon_gateway::metrics::Metrics;
use raccoon_gateway::publisher::{Delivery, OutboundMessage, ProducerClient, PublishError};
use raccoon_gateway::shutdown::ShutdownSignal;
use raccoon_gateway::worker::{RouterError, TopicAdmin};
use raccoon_gateway::{Event, EventRequest, Gateway};

/// Admin that accepts every topic and counts calls.
#[derive(Default)]
pub struct StubAdmin {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TopicAdmin for StubAdmin {
    async fn create_topic(&self, _name: &str) -> Result<(), RouterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Producer that records every message and acknowledges immediately.
#[derive(Default)]
pub struct RecordingProducer {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl RecordingProducer {
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ProducerClient for RecordingProducer {
    async fn enqueue(&self, message: OutboundMessage) -> Result<Delivery, PublishError> {
        self.sent.lock().push(message);
        Ok(Box::pin(async { Ok(()) }))
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Collector that keeps what it is given, or refuses everything once closed.
#[derive(Default)]
pub struct RecordingCollector {
    pub collected: Mutex<Vec<CollectRequest>>,
    pub closed: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl Collector for RecordingCollector {
    async fn collect(&self, request: CollectRequest) -> Result<(), CollectError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CollectError::Closed);
        }
        self.collected.lock().push(request);
        Ok(())
    }
}

pub fn test_config(max_connections: usize) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.server.max_connections = max_connections;
    config.server.ping_interval_ms = 200;
    config.server.pong_wait_interval_ms = 2000;
    config.server.write_wait_interval_ms = 500;
    config.worker.shutdown_grace_ms = 0;
    config.worker.flush_timeout_ms = 2000;
    config
}

/// Handler state over a recording collector, for oneshot tests.
pub fn state_with(collector: Arc<RecordingCollector>) -> Arc<AppState> {
    let config = test_config(10);
    let metrics = Arc::new(Metrics::new());
    let shutdown = ShutdownSignal::new();
    let registry = Arc::new(Registry::new(config.server.max_connections));
    let pinger = Pinger::spawn(config.server.pinger(), metrics.clone(), shutdown.subscribe());
    let upgrader = Arc::new(Upgrader::new(
        config.server.upgrader(),
        registry,
        pinger,
        metrics.clone(),
    ));

    Arc::new(AppState {
        server: config.server,
        upgrader,
        collector,
        metrics,
        shutdown,
    })
}

pub fn app_with(collector: Arc<RecordingCollector>) -> axum::Router {
    build_router(state_with(collector))
}

pub struct RunningGateway {
    pub addr: SocketAddr,
    pub shutdown: ShutdownSignal,
    pub producer: Arc<RecordingProducer>,
    pub metrics: Arc<Metrics>,
    pub handle: JoinHandle<std::io::Result<()>>,
}

impl RunningGateway {
    pub fn events_url(&self) -> String {
        format!("ws://{}/api/v1/events", self.addr)
    }

    /// Trigger shutdown and wait for the drain to finish.
    pub async fn stop(self) -> Arc<RecordingProducer> {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("gateway did not stop")
            .expect("gateway task panicked")
            .expect("gateway serve failed");
        self.producer
    }
}

/// Start a full gateway on an ephemeral port with in-memory broker clients.
pub async fn start_gateway(max_connections: usize) -> RunningGateway {
    start_gateway_with(test_config(max_connections)).await
}

pub async fn start_gateway_with(config: GatewayConfig) -> RunningGateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let shutdown = ShutdownSignal::new();
    let producer = Arc::new(RecordingProducer::default());
    let gateway = Gateway::new(
        config,
        Arc::new(StubAdmin::default()),
        producer.clone(),
        shutdown.clone(),
    );
    let metrics = gateway.metrics();
    let handle = tokio::spawn(gateway.serve(listener));

    RunningGateway {
        addr,
        shutdown,
        producer,
        metrics,
        handle,
    }
}

pub fn sample_request(req_guid: &str, events: usize) -> EventRequest {
    EventRequest {
        req_guid: req_guid.to_string(),
        sent_time: Some(raccoon_gateway::codec::Timestamp::now()),
        events: (0..events)
            .map(|i| Event::new("page_view", format!("{{\"seq\":{}}}", i).into_bytes()))
            .collect(),
    }
}
