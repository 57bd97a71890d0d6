//! Graceful shutdown coordination.
//!
//! A [`ShutdownSignal`] is cloned into every long-running task (HTTP server,
//! worker loop, reclaim task). Once triggered it stays triggered, so tasks
//! that start waiting late still observe it.
//!
//! # Example
//!
//! ```rust,ignore
//! use telemetry_pipeline::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//!
//! let worker_shutdown = shutdown.clone();
//! tokio::spawn(async move {
//!     tokio::select! {
//!         _ = worker_shutdown.cancelled() => {}
//!         // ... process events
//!     }
//! });
//!
//! shutdown.listen_for_signals().await;
//! ```

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// A signal for coordinating graceful shutdown across tasks.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Trigger shutdown (idempotent).
    pub fn trigger(&self) {
        self.sender.send_if_modified(|triggered| {
            if *triggered {
                false
            } else {
                *triggered = true;
                true
            }
        });
    }

    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolve once shutdown has been triggered.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = receiver.wait_for(|triggered| *triggered).await;
    }

    /// Wait for SIGINT or SIGTERM, then trigger shutdown.
    ///
    /// Also returns if shutdown was triggered some other way.
    pub async fn listen_for_signals(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM handler");
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
            _ = self.cancelled() => return,
        }

        self.trigger();
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
