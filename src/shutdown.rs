//! Graceful shutdown coordination.
//!
//! A [`ShutdownSignal`] is created once in `main` and cloned into the HTTP
//! server and the delivery worker. It fires on SIGINT/SIGTERM or when
//! [`trigger`](ShutdownSignal::trigger) is called.
//!
//! # Example
//!
//! ```rust,ignore
//! use chat_relay::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! let worker_shutdown = shutdown.clone();
//!
//! tokio::spawn(async move {
//!     while !worker_shutdown.is_shutdown() {
//!         // ... deliver one message
//!     }
//! });
//!
//! shutdown.wait().await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info};

/// Default time `main` waits for the worker after shutdown starts.
const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

/// A signal for coordinating graceful shutdown across components.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    /// Wakes tasks currently waiting on [`cancelled`](Self::cancelled)
    sender: broadcast::Sender<()>,
    /// Stays set once shutdown has started
    triggered: Arc<AtomicBool>,
    /// How long to wait for components to finish
    timeout: Duration,
}

impl ShutdownSignal {
    /// Create a new shutdown signal with the default timeout (30 seconds).
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT))
    }

    /// Create a new shutdown signal with a custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            triggered: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    /// Get the shutdown timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for SIGINT, SIGTERM or a programmatic trigger, then notify
    /// every other holder of this signal.
    pub async fn wait(&self) {
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
                info!(signal = "SIGINT", "Stopping relay");
            }
            _ = terminate => {
                info!(signal = "SIGTERM", "Stopping relay");
            }
            _ = self.cancelled() => return,
        }

        self.notify();
    }

    /// Subscribe to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Non-blocking check whether shutdown has started.
    pub fn is_shutdown(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Trigger shutdown manually (for tests or programmatic shutdown).
    pub fn trigger(&self) {
        if !self.is_shutdown() {
            info!("Shutdown triggered programmatically");
        }
        self.notify();
    }

    fn notify(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        let _ = self.sender.send(());
    }

    /// Resolve once shutdown has started.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        if self.is_shutdown() {
            return;
        }
        let _ = receiver.recv().await;
    }

    /// Sleep for `duration`, ending early if shutdown starts.
    ///
    /// Returns `true` if the full duration elapsed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled() => false,
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
