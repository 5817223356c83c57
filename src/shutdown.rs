//! Graceful shutdown coordination for the gateway.
//!
//! A [`ShutdownSignal`] fans a single stop notification out to every
//! background component (HTTP server, pinger, gauge reporter) once a
//! termination signal arrives or shutdown is triggered programmatically.
//!
//! # Example
//!
//! ```rust,ignore
//! use raccoon_gateway::shutdown::ShutdownSignal;
//!
//! #[tokio::main]
//! async fn main() {
//!     let shutdown = ShutdownSignal::new();
//!
//!     let mut stop = shutdown.subscribe();
//!     tokio::spawn(async move {
//!         loop {
//!             tokio::select! {
//!                 _ = stop.recv() => break,
//!                 // ... periodic work
//!             }
//!         }
//!     });
//!
//!     // Blocks until SIGINT/SIGTERM, then notifies every subscriber
//!     shutdown.listen().await;
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// A signal for coordinating graceful shutdown across components.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    fired: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wait for SIGINT or SIGTERM, then notify all subscribers.
    ///
    /// Also returns if shutdown was already triggered programmatically.
    pub async fn listen(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.triggered() => return,
        }

        self.fire();
    }

    /// Subscribe to shutdown notifications.
    ///
    /// A receiver created after shutdown fired will not see the message; use
    /// [`ShutdownSignal::triggered`] when subscribing late is possible.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Resolves once shutdown has fired, including if it already has.
    pub async fn triggered(&self) {
        let mut receiver = self.sender.subscribe();
        if self.is_shutdown() {
            return;
        }
        let _ = receiver.recv().await;
    }

    /// Check if shutdown has been triggered.
    pub fn is_shutdown(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Trigger shutdown manually (for testing or programmatic shutdown).
    pub fn trigger(&self) {
        info!("Shutdown triggered programmatically");
        self.fire();
    }

    fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
        let _ = self.sender.send(());
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
