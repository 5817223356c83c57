//! Connection upgrader.
//!
//! An upgraded socket goes through one of three outcomes:
//!
//! ```text
//! socket ──► try_register ──► Accepted  ──► Connection (keepalive armed, pinger notified)
//!                  │
//!                  ├──► Duplicate        ──► MAX_USER_LIMIT_REACHED + close 1008
//!                  └──► CapacityReached  ──► MAX_CONNECTION_LIMIT_REACHED + close 1008
//! ```
//!
//! Rejections are sent as a binary [`EventResponse`] followed by a close frame,
//! so clients read refusals on the same channel as normal acknowledgements.
//!
//! An accepted [`Connection`] owns a registration guard; dropping the
//! connection removes the identity from the [`Registry`] exactly once,
//! whichever path ends it.

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::http::HeaderMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::pinger::{KeepaliveTarget, PingerHandle};
use super::registry::{Registry, RegistryError};
use super::{ConnectionIdentity, TransportError};
use crate::codec::{Codec, Code, EventResponse};
use crate::metrics::{Metrics, RejectReason};

/// Upgrader settings, taken from the server configuration.
#[derive(Debug, Clone)]
pub struct UpgraderConfig {
    /// Read deadline window; any inbound frame extends it
    pub pong_wait_interval: Duration,
    /// Bound on every write to the peer
    pub write_wait_interval: Duration,
    pub conn_id_header: String,
    pub conn_group_header: String,
}

/// Accepts or rejects upgraded sockets.
pub struct Upgrader {
    config: UpgraderConfig,
    registry: Arc<Registry>,
    pinger: PingerHandle,
    metrics: Arc<Metrics>,
}

impl Upgrader {
    pub fn new(
        config: UpgraderConfig,
        registry: Arc<Registry>,
        pinger: PingerHandle,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            registry,
            pinger,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Read the peer identity from the handshake headers.
    pub fn identify(&self, headers: &HeaderMap) -> ConnectionIdentity {
        ConnectionIdentity::from_headers(
            headers,
            &self.config.conn_id_header,
            &self.config.conn_group_header,
        )
    }

    /// Register an upgraded socket, or reject it in-band and close it.
    pub async fn accept(
        &self,
        socket: WebSocket,
        identity: ConnectionIdentity,
    ) -> Result<Connection, RegistryError> {
        let (sink, stream) = socket.split();
        let writer = Arc::new(PeerWriter::new(identity.clone(), sink));

        if let Err(rejection) = self.registry.try_register(&identity) {
            let (code, reason, metric) = match rejection {
                RegistryError::Duplicate => (
                    Code::MaxUserLimitReached,
                    "Duplicate connection",
                    RejectReason::Exists,
                ),
                RegistryError::CapacityReached => (
                    Code::MaxConnectionLimitReached,
                    "Max connection reached",
                    RejectReason::ServerLimit,
                ),
            };
            self.metrics.connection_rejected(metric);
            warn!(
                conn_id = %identity.id,
                conn_group = %identity.group,
                reason = %rejection,
                "Disconnecting peer"
            );
            writer
                .reject(code, reason, self.config.write_wait_interval)
                .await;
            return Err(rejection);
        }

        let registration = Registration {
            registry: self.registry.clone(),
            identity: identity.clone(),
        };

        Metrics::increment(&self.metrics.connections_accepted);
        info!(conn_id = %identity.id, conn_group = %identity.group, "Peer connected");

        let target: Arc<dyn KeepaliveTarget> = writer.clone();
        self.pinger.register(Arc::downgrade(&target)).await;

        Ok(Connection {
            identity,
            writer,
            stream,
            connected_at: Instant::now(),
            read_deadline: Instant::now() + self.config.pong_wait_interval,
            pong_wait_interval: self.config.pong_wait_interval,
            write_wait_interval: self.config.write_wait_interval,
            metrics: self.metrics.clone(),
            _registration: registration,
        })
    }
}

/// Removes the identity from the registry when dropped.
struct Registration {
    registry: Arc<Registry>,
    identity: ConnectionIdentity,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(&self.identity);
    }
}

/// Write half of a peer socket, shared by the read loop and the pinger.
pub struct PeerWriter {
    identity: ConnectionIdentity,
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl PeerWriter {
    fn new(identity: ConnectionIdentity, sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            identity,
            sink: Mutex::new(sink),
        }
    }

    /// Send one frame, bounded by `timeout`.
    pub async fn send(&self, message: Message, timeout: Duration) -> Result<(), TransportError> {
        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send(message).await
        };

        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Write(e.to_string())),
            Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
        }
    }

    async fn reject(&self, code: Code, reason: &str, timeout: Duration) {
        let response = EventResponse::error(code, reason.to_lowercase());
        match Codec::Proto.encode_response(&response) {
            Ok(bytes) => {
                if let Err(e) = self.send(Message::Binary(bytes), timeout).await {
                    debug!(conn_id = %self.identity.id, error = %e, "Failed to send rejection");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode rejection"),
        }
        self.close(close_code::POLICY, reason, timeout).await;
    }

    /// Send a close frame and shut the sink down.
    pub async fn close(&self, code: u16, reason: &str, timeout: Duration) {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        if let Err(e) = self.send(Message::Close(Some(frame)), timeout).await {
            debug!(conn_id = %self.identity.id, error = %e, "Failed to send close frame");
        }
        let mut sink = self.sink.lock().await;
        let _ = tokio::time::timeout(timeout, sink.close()).await;
    }
}

#[async_trait]
impl KeepaliveTarget for PeerWriter {
    fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    async fn ping(&self, write_wait: Duration) -> Result<(), TransportError> {
        self.send(Message::Ping(b"--ping--".to_vec()), write_wait).await
    }
}

/// A data frame from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

/// Terminal read outcomes. Each one ends the read loop.
#[derive(Debug)]
pub enum ReadError {
    /// Peer sent a close frame or the stream ended
    Closed(Option<u16>),
    /// No traffic within the read deadline
    DeadlineExceeded,
    Transport(axum::Error),
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::Closed(Some(code)) => write!(f, "closed with code {}", code),
            ReadError::Closed(None) => write!(f, "closed"),
            ReadError::DeadlineExceeded => write!(f, "read deadline exceeded"),
            ReadError::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

/// An accepted peer. Owned by the task running its read loop.
pub struct Connection {
    identity: ConnectionIdentity,
    writer: Arc<PeerWriter>,
    stream: SplitStream<WebSocket>,
    connected_at: Instant,
    read_deadline: Instant,
    pong_wait_interval: Duration,
    write_wait_interval: Duration,
    metrics: Arc<Metrics>,
    _registration: Registration,
}

impl Connection {
    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub fn session_duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Wait for the next data frame.
    ///
    /// Control frames are handled here: a ping is answered with a pong, and
    /// every inbound frame pushes the read deadline out by the pong wait
    /// interval.
    pub async fn next_message(&mut self) -> Result<Inbound, ReadError> {
        loop {
            let frame = match tokio::time::timeout_at(self.read_deadline, self.stream.next()).await
            {
                Err(_) => return Err(ReadError::DeadlineExceeded),
                Ok(None) => return Err(ReadError::Closed(None)),
                Ok(Some(Err(e))) => return Err(ReadError::Transport(e)),
                Ok(Some(Ok(frame))) => frame,
            };

            self.read_deadline = Instant::now() + self.pong_wait_interval;

            match frame {
                Message::Text(text) => return Ok(Inbound::Text(text)),
                Message::Binary(bytes) => return Ok(Inbound::Binary(bytes)),
                Message::Ping(payload) => {
                    debug!(conn_id = %self.identity.id, "Client pinged");
                    if let Err(e) = self
                        .writer
                        .send(Message::Pong(payload), self.write_wait_interval)
                        .await
                    {
                        Metrics::increment(&self.metrics.server_pong_failures);
                        debug!(conn_id = %self.identity.id, error = %e, "Failed to send pong");
                    }
                }
                Message::Pong(_) => {}
                Message::Close(frame) => return Err(ReadError::Closed(frame.map(|f| f.code))),
            }
        }
    }

    /// Send a data frame, bounded by the write wait interval.
    pub async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.writer.send(message, self.write_wait_interval).await
    }

    /// Close the transport. The registry entry is released when `self` drops.
    pub async fn close(self, code: u16, reason: &str) {
        self.writer
            .close(code, reason, self.write_wait_interval)
            .await;
    }
}
