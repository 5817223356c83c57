//! HTTP surface.
//!
//! ```text
//! GET  /ping            -> "pong"
//! GET  /metrics         -> JSON counters
//! GET  /api/v1/events   -> WebSocket upgrade, one batch per frame
//! POST /api/v1/events   -> one batch per request
//! ```
//!
//! Both event endpoints answer with an `EventResponse` in the caller's
//! format. An `OK` means the batch entered the hand-off channel, not that
//! the broker stored it.

pub mod rest;
pub mod websocket;

use axum::{
    extract::State,
    response::Json,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::collector::Collector;
use crate::config::ServerConfig;
use crate::connection::Upgrader;
use crate::metrics::Metrics;
use crate::shutdown::ShutdownSignal;

/// State shared by every handler.
pub struct AppState {
    pub server: ServerConfig,
    pub upgrader: Arc<Upgrader>,
    pub collector: Arc<dyn Collector>,
    pub metrics: Arc<Metrics>,
    pub shutdown: ShutdownSignal,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/metrics", get(get_metrics))
        .route(
            "/api/v1/events",
            get(websocket::upgrade).post(rest::submit),
        )
        .with_state(state)
}

async fn ping() -> &'static str {
    "pong"
}

/// Counter snapshot plus connection occupancy and drain state.
async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.metrics.snapshot();
    let uptime = snapshot.uptime_seconds;

    let uptime_str = if uptime < 60 {
        format!("{}s", uptime)
    } else if uptime < 3600 {
        format!("{}m {}s", uptime / 60, uptime % 60)
    } else {
        format!("{}h {}m {}s", uptime / 3600, (uptime % 3600) / 60, uptime % 60)
    };

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": uptime_str,
        "connections": {
            "active": state.upgrader.registry().len(),
            "capacity": state.upgrader.registry().capacity(),
        },
        "counters": snapshot,
        "status": if state.shutdown.is_shutdown() { "draining" } else { "running" }
    }))
}
