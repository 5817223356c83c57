//! Persistent client connections.
//!
//! - [`registry`]: who is connected, with a global capacity
//! - [`upgrader`]: turns an upgraded WebSocket into a registered [`Connection`]
//!   or rejects it in-band
//! - [`pinger`]: active keepalive through a bounded work queue

pub mod identity;
pub mod pinger;
pub mod registry;
pub mod upgrader;

use thiserror::Error;

pub use identity::ConnectionIdentity;
pub use pinger::{KeepaliveTarget, Pinger, PingerConfig, PingerHandle};
pub use registry::{Registry, RegistryError};
pub use upgrader::{Connection, Inbound, PeerWriter, ReadError, Upgrader, UpgraderConfig};

/// Failures writing to a peer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("write timed out after {0}ms")]
    Timeout(u64),

    #[error("write failed: {0}")]
    Write(String),
}
