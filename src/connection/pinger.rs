//! Active keepalive.
//!
//! A single dispatch loop keeps a list of live peers. On every tick it pushes
//! each peer onto a bounded work queue, and a fixed group of workers sends the
//! pings. The queue bound and the worker count cap how many pings are in
//! flight at once, however many peers are connected.
//!
//! ```text
//! register ──► dispatch loop ──tick──► [ bounded queue ] ──► worker 1..N ──► ping
//! ```
//!
//! A failed ping only bumps a counter. The peer's own read deadline is what
//! eventually closes a dead connection.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info};

use super::{ConnectionIdentity, TransportError};
use crate::metrics::Metrics;

/// Something the pinger can probe.
#[async_trait]
pub trait KeepaliveTarget: Send + Sync {
    fn identity(&self) -> &ConnectionIdentity;

    /// Send one keepalive probe, bounded by `write_wait`.
    async fn ping(&self, write_wait: Duration) -> Result<(), TransportError>;
}

/// Pinger settings.
#[derive(Debug, Clone)]
pub struct PingerConfig {
    pub ping_interval: Duration,
    pub write_wait_interval: Duration,
    /// Number of ping workers
    pub workers: usize,
    /// Work queue bound; sized to the connection capacity
    pub queue_size: usize,
}

/// Handle used to hand newly accepted peers to the pinger.
#[derive(Clone)]
pub struct PingerHandle {
    registrations: mpsc::Sender<Weak<dyn KeepaliveTarget>>,
}

impl PingerHandle {
    /// Start pinging a peer. The pinger holds only a weak reference, so a
    /// dropped connection falls out of the rotation on the next tick.
    pub async fn register(&self, target: Weak<dyn KeepaliveTarget>) {
        if self.registrations.send(target).await.is_err() {
            debug!("Pinger stopped, peer not registered for keepalive");
        }
    }
}

pub struct Pinger;

impl Pinger {
    /// Spawn the dispatch loop and its workers. They stop when `shutdown` fires.
    pub fn spawn(
        config: PingerConfig,
        metrics: Arc<Metrics>,
        shutdown: broadcast::Receiver<()>,
    ) -> PingerHandle {
        let queue_size = config.queue_size.max(1);
        let (registrations_tx, registrations_rx) = mpsc::channel(queue_size);
        let (work_tx, work_rx) = mpsc::channel::<Arc<dyn KeepaliveTarget>>(queue_size);
        let work_rx = Arc::new(Mutex::new(work_rx));

        for worker_id in 0..config.workers.max(1) {
            tokio::spawn(ping_worker(
                worker_id,
                work_rx.clone(),
                config.write_wait_interval,
                metrics.clone(),
            ));
        }

        tokio::spawn(dispatch(
            registrations_rx,
            work_tx,
            config.ping_interval,
            shutdown,
        ));

        info!(
            workers = config.workers,
            interval_ms = config.ping_interval.as_millis() as u64,
            "Pinger started"
        );

        PingerHandle {
            registrations: registrations_tx,
        }
    }
}

async fn dispatch(
    mut registrations: mpsc::Receiver<Weak<dyn KeepaliveTarget>>,
    work: mpsc::Sender<Arc<dyn KeepaliveTarget>>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut peers: Vec<Weak<dyn KeepaliveTarget>> = Vec::new();
    let mut ticker = tokio::time::interval(interval);
    // first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            Some(peer) = registrations.recv() => peers.push(peer),
            _ = ticker.tick() => {
                peers.retain(|peer| peer.strong_count() > 0);
                for peer in &peers {
                    let Some(target) = peer.upgrade() else { continue };
                    if work.send(target).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    info!("Pinger stopped");
}

async fn ping_worker(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::Receiver<Arc<dyn KeepaliveTarget>>>>,
    write_wait: Duration,
    metrics: Arc<Metrics>,
) {
    loop {
        let next = { queue.lock().await.recv().await };
        let Some(target) = next else { break };

        if let Err(e) = target.ping(write_wait).await {
            Metrics::increment(&metrics.server_ping_failures);
            debug!(
                worker_id,
                conn_id = %target.identity().id,
                conn_group = %target.identity().group,
                error = %e,
                "Failed to ping peer"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPeer {
        identity: ConnectionIdentity,
        pings: AtomicUsize,
        fail: bool,
    }

    impl CountingPeer {
        fn new(id: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                identity: ConnectionIdentity::new(id, "g"),
                pings: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl KeepaliveTarget for CountingPeer {
        fn identity(&self) -> &ConnectionIdentity {
            &self.identity
        }

        async fn ping(&self, _write_wait: Duration) -> Result<(), TransportError> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(TransportError::Write("broken pipe".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn config() -> PingerConfig {
        PingerConfig {
            ping_interval: Duration::from_millis(10),
            write_wait_interval: Duration::from_millis(10),
            workers: 2,
            queue_size: 8,
        }
    }

    fn weak(peer: &Arc<CountingPeer>) -> Weak<dyn KeepaliveTarget> {
        let target: Arc<dyn KeepaliveTarget> = peer.clone();
        Arc::downgrade(&target)
    }

    #[tokio::test]
    async fn test_pings_every_registered_peer() {
        let (tx, rx) = broadcast::channel(1);
        let metrics = Arc::new(Metrics::new());
        let handle = Pinger::spawn(config(), metrics.clone(), rx);

        let a = CountingPeer::new("a", false);
        let b = CountingPeer::new("b", false);
        handle.register(weak(&a)).await;
        handle.register(weak(&b)).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(()).unwrap();

        assert!(a.pings.load(Ordering::SeqCst) >= 2);
        assert!(b.pings.load(Ordering::SeqCst) >= 2);
        assert_eq!(metrics.server_ping_failures.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_ping_failure_is_counted_not_fatal() {
        let (tx, rx) = broadcast::channel(1);
        let metrics = Arc::new(Metrics::new());
        let handle = Pinger::spawn(config(), metrics.clone(), rx);

        let broken = CountingPeer::new("broken", true);
        let healthy = CountingPeer::new("healthy", false);
        handle.register(weak(&broken)).await;
        handle.register(weak(&healthy)).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(()).unwrap();

        assert!(metrics.server_ping_failures.load(Ordering::Relaxed) >= 2);
        assert!(healthy.pings.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_dropped_peer_is_no_longer_pinged() {
        let (tx, rx) = broadcast::channel(1);
        let metrics = Arc::new(Metrics::new());
        let handle = Pinger::spawn(config(), metrics.clone(), rx);

        let peer = CountingPeer::new("gone", false);
        let target = weak(&peer);
        handle.register(target.clone()).await;
        drop(peer);

        tokio::time::sleep(Duration::from_millis(40)).await;
        tx.send(()).unwrap();

        assert!(target.upgrade().is_none());
        assert_eq!(metrics.server_ping_failures.load(Ordering::Relaxed), 0);
    }
}
