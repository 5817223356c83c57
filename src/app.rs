//! Wiring and lifecycle.
//!
//! [`Gateway::new`] builds every component and hands each one the handles it
//! needs. [`Gateway::serve`] runs the listener until shutdown, then drains:
//!
//! 1. stop accepting (graceful shutdown of the listener, WebSocket peers get
//!    a going-away close)
//! 2. wait `worker.shutdown_grace_ms` for in-flight requests to enqueue
//! 3. flush the worker pool, which flushes the publisher
//! 4. return

use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::collector::ChannelCollector;
use crate::config::GatewayConfig;
use crate::connection::{Pinger, Registry, Upgrader};
use crate::http::{build_router, AppState};
use crate::metrics::{report_connections, Metrics};
use crate::publisher::{ProducerClient, Publisher};
use crate::shutdown::ShutdownSignal;
use crate::worker::{TopicAdmin, TopicRouter, WorkerPool};

pub struct Gateway {
    config: GatewayConfig,
    state: Arc<AppState>,
    pool: WorkerPool,
    shutdown: ShutdownSignal,
}

impl Gateway {
    /// Build the gateway around the given broker clients.
    ///
    /// Spawns the pinger and the connection reporter, so this must run inside
    /// a tokio runtime. Workers start in [`Gateway::serve`].
    pub fn new(
        config: GatewayConfig,
        admin: Arc<dyn TopicAdmin>,
        producer: Arc<dyn ProducerClient>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(Registry::new(config.server.max_connections));

        let pinger = Pinger::spawn(config.server.pinger(), metrics.clone(), shutdown.subscribe());
        let upgrader = Arc::new(Upgrader::new(
            config.server.upgrader(),
            registry.clone(),
            pinger,
            metrics.clone(),
        ));

        let (sender, receiver) = mpsc::channel(config.worker.channel_size);
        let router = Arc::new(TopicRouter::new(
            config.publisher.topic_pattern.clone(),
            admin,
        ));
        let publisher = Arc::new(Publisher::new(producer, metrics.clone()));
        let pool = WorkerPool::new(
            config.worker.pool_size,
            receiver,
            router,
            publisher,
            metrics.clone(),
        );

        tokio::spawn(report_connections(
            registry,
            metrics.clone(),
            Duration::from_millis(config.metrics.report_interval_ms),
            shutdown.subscribe(),
        ));

        let state = Arc::new(AppState {
            server: config.server.clone(),
            upgrader,
            collector: Arc::new(ChannelCollector::new(sender)),
            metrics,
            shutdown: shutdown.clone(),
        });

        Self {
            config,
            state,
            pool,
            shutdown,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.state.metrics.clone()
    }

    /// Serve on `listener` until shutdown fires, then drain and flush.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        self.pool.start();

        let addr = listener.local_addr()?;
        info!(%addr, "Gateway listening");

        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.triggered().await })
            .await?;

        let grace = Duration::from_millis(self.config.worker.shutdown_grace_ms);
        info!(grace_ms = grace.as_millis() as u64, "Listener closed, draining");
        tokio::time::sleep(grace).await;

        let flush_timeout = Duration::from_millis(self.config.worker.flush_timeout_ms);
        if let Err(e) = self.pool.flush(flush_timeout).await {
            warn!(error = %e, "Shutdown flush incomplete");
        }

        info!("Gateway stopped");
        Ok(())
    }
}
