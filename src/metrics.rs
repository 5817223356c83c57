//! Process counters.
//!
//! Every component reports into one shared [`Metrics`] instance. Process-wide
//! counters are lock-free atomics. Batch traffic is also kept per connection
//! group, and the per-group connection gauge is refreshed by
//! [`report_connections`] on a timer. `GET /metrics` renders a
//! [`MetricsSnapshot`].

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::connection::Registry;

/// Why a batch could not be read from a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFailure {
    EmptyBody,
    ReadError,
    Deserialize,
    CloseError,
}

impl ReadFailure {
    /// Label used in the per-group breakdown.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadFailure::EmptyBody => "emptybody",
            ReadFailure::ReadError => "readerr",
            ReadFailure::Deserialize => "deserr",
            ReadFailure::CloseError => "closeerr",
        }
    }
}

/// Batch traffic for one connection group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupCounters {
    pub batches_read_success: u64,
    pub batches_failed: BTreeMap<&'static str, u64>,
    pub events_received: u64,
    pub bytes_received: u64,
}

/// Why a connection was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UpgradeFailure,
    Exists,
    ServerLimit,
}

/// Application counters
#[derive(Debug)]
pub struct Metrics {
    start_time: Instant,

    pub batches_read_success: AtomicU64,
    pub batches_failed_empty_body: AtomicU64,
    pub batches_failed_read_error: AtomicU64,
    pub batches_failed_deserialize: AtomicU64,
    pub batches_failed_close_error: AtomicU64,
    pub events_received: AtomicU64,
    pub bytes_received: AtomicU64,

    pub connections_accepted: AtomicU64,
    pub connections_rejected_upgrade: AtomicU64,
    pub connections_rejected_exists: AtomicU64,
    pub connections_rejected_limit: AtomicU64,

    pub server_ping_failures: AtomicU64,
    pub server_pong_failures: AtomicU64,

    pub topic_resolution_failures: AtomicU64,
    pub batches_dropped: AtomicU64,
    pub messages_delivered: AtomicU64,
    pub delivery_failures: AtomicU64,

    groups: Mutex<HashMap<String, GroupCounters>>,
    connections_per_group: Mutex<HashMap<String, usize>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            batches_read_success: AtomicU64::new(0),
            batches_failed_empty_body: AtomicU64::new(0),
            batches_failed_read_error: AtomicU64::new(0),
            batches_failed_deserialize: AtomicU64::new(0),
            batches_failed_close_error: AtomicU64::new(0),
            events_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            connections_accepted: AtomicU64::new(0),
            connections_rejected_upgrade: AtomicU64::new(0),
            connections_rejected_exists: AtomicU64::new(0),
            connections_rejected_limit: AtomicU64::new(0),
            server_ping_failures: AtomicU64::new(0),
            server_pong_failures: AtomicU64::new(0),
            topic_resolution_failures: AtomicU64::new(0),
            batches_dropped: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            groups: Mutex::new(HashMap::new()),
            connections_per_group: Mutex::new(HashMap::new()),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn with_group(&self, group: &str, update: impl FnOnce(&mut GroupCounters)) {
        let mut groups = self.groups.lock();
        match groups.get_mut(group) {
            Some(counters) => update(counters),
            None => update(groups.entry(group.to_string()).or_default()),
        }
    }

    /// Record raw payload bytes, before any decoding is attempted.
    pub fn bytes_read(&self, group: &str, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.with_group(group, |c| c.bytes_received += bytes as u64);
    }

    /// Record a decoded batch.
    pub fn batch_received(&self, group: &str, events: usize) {
        self.batches_read_success.fetch_add(1, Ordering::Relaxed);
        self.events_received.fetch_add(events as u64, Ordering::Relaxed);
        self.with_group(group, |c| {
            c.batches_read_success += 1;
            c.events_received += events as u64;
        });
    }

    pub fn batch_failed(&self, group: &str, reason: ReadFailure) {
        let counter = match reason {
            ReadFailure::EmptyBody => &self.batches_failed_empty_body,
            ReadFailure::ReadError => &self.batches_failed_read_error,
            ReadFailure::Deserialize => &self.batches_failed_deserialize,
            ReadFailure::CloseError => &self.batches_failed_close_error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.with_group(group, |c| {
            *c.batches_failed.entry(reason.as_str()).or_insert(0) += 1;
        });
    }

    pub fn group(&self, group: &str) -> Option<GroupCounters> {
        self.groups.lock().get(group).cloned()
    }

    pub fn connection_rejected(&self, reason: RejectReason) {
        let counter = match reason {
            RejectReason::UpgradeFailure => &self.connections_rejected_upgrade,
            RejectReason::Exists => &self.connections_rejected_exists,
            RejectReason::ServerLimit => &self.connections_rejected_limit,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_connections_per_group(&self, counts: HashMap<String, usize>) {
        *self.connections_per_group.lock() = counts;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            uptime_seconds: self.uptime_seconds(),
            batches_read_success: load(&self.batches_read_success),
            batches_read_failed: load(&self.batches_failed_empty_body)
                + load(&self.batches_failed_read_error)
                + load(&self.batches_failed_deserialize)
                + load(&self.batches_failed_close_error),
            events_received: load(&self.events_received),
            bytes_received: load(&self.bytes_received),
            connections_accepted: load(&self.connections_accepted),
            connections_rejected: load(&self.connections_rejected_upgrade)
                + load(&self.connections_rejected_exists)
                + load(&self.connections_rejected_limit),
            server_ping_failures: load(&self.server_ping_failures),
            server_pong_failures: load(&self.server_pong_failures),
            topic_resolution_failures: load(&self.topic_resolution_failures),
            batches_dropped: load(&self.batches_dropped),
            messages_delivered: load(&self.messages_delivered),
            delivery_failures: load(&self.delivery_failures),
            groups: self.groups.lock().clone(),
            connections_per_group: self.connections_per_group.lock().clone(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub batches_read_success: u64,
    pub batches_read_failed: u64,
    pub events_received: u64,
    pub bytes_received: u64,
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub server_ping_failures: u64,
    pub server_pong_failures: u64,
    pub topic_resolution_failures: u64,
    pub batches_dropped: u64,
    pub messages_delivered: u64,
    pub delivery_failures: u64,
    pub groups: HashMap<String, GroupCounters>,
    pub connections_per_group: HashMap<String, usize>,
}

/// Periodically copy the registry's per-group counts into the gauge.
///
/// Runs until the shutdown receiver fires.
pub async fn report_connections(
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("Connection reporter stopped");
                return;
            }
            _ = ticker.tick() => {
                let counts = registry.count_by_group();
                debug!(groups = counts.len(), total = registry.len(), "Connection gauge");
                metrics.set_connections_per_group(counts);
            }
        }
    }
}
