//! # Raccoon Gateway
//!
//! Event ingestion gateway: clients push batches of events over WebSocket
//! or HTTP, and the gateway forwards each event to a broker topic derived
//! from the client's group.
//!
//! ## Architecture
//!
//! ```text
//! Client -> WebSocket/REST -> Collector -> [bounded channel] -> Workers -> TopicRouter -> Publisher -> Kafka
//! ```
//!
//! ## Modules
//!
//! - [`connection`]: registry, upgrader and keepalive for WebSocket peers
//! - [`codec`]: request/response envelopes in JSON and protobuf form
//! - [`collector`]: hand-off from handlers to the worker pool
//! - [`worker`]: worker pool and per-group topic resolution
//! - [`publisher`]: delivery bookkeeping over the broker producer
//! - [`http`]: routes and handlers
//! - [`app`]: wiring and the shutdown sequence

pub mod app;
pub mod codec;
pub mod collector;
pub mod config;
pub mod connection;
pub mod http;
pub mod metrics;
pub mod publisher;
pub mod shutdown;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export commonly used types at crate root
pub use app::Gateway;
pub use codec::{Code, Codec, Event, EventRequest, EventResponse, Status};
pub use collector::{ChannelCollector, CollectRequest, Collector};
pub use config::GatewayConfig;
pub use connection::{ConnectionIdentity, Registry, RegistryError};
pub use publisher::{ProducerClient, Publisher, PublishError};
pub use worker::{RouterError, TopicAdmin, TopicRouter, WorkerPool};
