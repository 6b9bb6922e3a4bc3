//! Outbound delivery.
//!
//! A [`Deliver`] implementation performs exactly one outbound attempt and
//! reports what the destination said. All retry, pacing and backoff
//! decisions live in the [`worker`].
//!
//! ## Built-in deliverers
//!
//! - [`WebhookClient`]: HTTP POST to a Discord-style webhook
//! - [`LogDeliverer`]: logs payloads instead of sending them (dry run)
//!
//! ## Custom deliverers
//!
//! ```rust,ignore
//! use chat_relay::delivery::{Attempt, Deliver, DeliveryError};
//! use async_trait::async_trait;
//!
//! struct Stdout;
//!
//! #[async_trait]
//! impl Deliver for Stdout {
//!     fn name(&self) -> &str {
//!         "stdout"
//!     }
//!
//!     async fn deliver(&self, _destination: &str, content: &str) -> Result<Attempt, DeliveryError> {
//!         println!("{}", content);
//!         Ok(Attempt::Delivered { reset_after: None })
//!     }
//! }
//! ```

pub mod log;
pub mod webhook;
pub mod worker;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use log::LogDeliverer;
pub use webhook::WebhookClient;
pub use worker::{DeliveryWorker, WorkerConfig, WorkerHandle, WorkerState, WorkerStats};

/// Why a payload could not be delivered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// No usable destination at send time
    #[error("destination is not configured")]
    Destination,

    /// The request did not complete within the per-attempt timeout
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Connection, TLS or protocol failure
    #[error("transport error: {0}")]
    Transport(String),

    /// The destination answered with a non-2xx status other than a
    /// first 429
    #[error("destination returned status {0}")]
    Status(u16),

    /// The destination was still rate limiting after the single retry
    #[error("still rate limited, retry after {}ms", .retry_after.as_millis())]
    RateLimited { retry_after: Duration },
}

impl DeliveryError {
    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryError::Destination => "destination",
            DeliveryError::Timeout(_) => "timeout",
            DeliveryError::Transport(_) => "transport",
            DeliveryError::Status(_) => "status",
            DeliveryError::RateLimited { .. } => "rate_limited",
        }
    }
}

/// What a single outbound attempt produced, short of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// 2xx; `reset_after` is the optional pacing hint from the response
    Delivered { reset_after: Option<Duration> },

    /// 429; how long the destination asked us to wait
    RateLimited { retry_after: Duration },
}

/// One outbound send.
///
/// Implementations must be `Send + Sync` so the worker can own them behind
/// an `Arc`.
#[async_trait]
pub trait Deliver: Send + Sync {
    /// Name used in log lines (e.g., "webhook", "log")
    fn name(&self) -> &str;

    /// Send `content` to `destination` once.
    async fn deliver(&self, destination: &str, content: &str) -> Result<Attempt, DeliveryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            DeliveryError::Timeout(Duration::from_secs(10)).to_string(),
            "request timed out after 10000ms"
        );
        assert_eq!(
            DeliveryError::Status(502).to_string(),
            "destination returned status 502"
        );
        assert_eq!(
            DeliveryError::RateLimited {
                retry_after: Duration::from_millis(1500)
            }
            .to_string(),
            "still rate limited, retry after 1500ms"
        );
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(DeliveryError::Destination.kind(), "destination");
        assert_eq!(DeliveryError::Transport("reset".into()).kind(), "transport");
    }
}
