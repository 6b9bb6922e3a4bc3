//! Webhook client - HTTP POST to a Discord-style webhook.
//!
//! # Example
//!
//! ```rust,ignore
//! use chat_relay::delivery::WebhookClient;
//! use std::time::Duration;
//!
//! let client = WebhookClient::new()?.with_timeout(Duration::from_secs(10));
//! client.deliver("https://discord.com/api/webhooks/...", "12:00 [**Bob**]: `hi`").await?;
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::{debug, warn};

use super::{Attempt, Deliver, DeliveryError};
use crate::destination::redact;
use crate::ratelimit::{self, DEFAULT_RETRY_DELAY};

/// Default timeout for a single webhook request
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client identifier sent with every request.
pub const USER_AGENT: &str = concat!("chat-relay/", env!("CARGO_PKG_VERSION"));

/// Sends payloads as `{"content": "..."}` to a webhook URL.
///
/// One call to [`deliver`](Deliver::deliver) is one HTTP request; the
/// client never retries on its own.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    /// HTTP client (reused for connection pooling)
    client: Client,

    /// Per-request timeout
    timeout: Duration,

    /// Wait assumed for a 429 without a usable hint
    default_retry_delay: Duration,
}

impl WebhookClient {
    /// Build a client that identifies itself with [`USER_AGENT`].
    pub fn new() -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| DeliveryError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            timeout: DEFAULT_TIMEOUT,
            default_retry_delay: DEFAULT_RETRY_DELAY,
        })
    }

    /// Set custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the delay assumed when a 429 carries no retry hint
    pub fn with_default_retry_delay(mut self, delay: Duration) -> Self {
        self.default_retry_delay = delay;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn classify(&self, error: reqwest::Error) -> DeliveryError {
        if error.is_timeout() {
            DeliveryError::Timeout(self.timeout)
        } else if error.is_connect() {
            DeliveryError::Transport(format!("connection failed: {error}"))
        } else {
            DeliveryError::Transport(error.to_string())
        }
    }
}

#[async_trait]
impl Deliver for WebhookClient {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, destination: &str, content: &str) -> Result<Attempt, DeliveryError> {
        debug!(destination = %redact(destination), "Sending webhook");

        let response = self
            .client
            .post(destination)
            .timeout(self.timeout)
            .json(&json!({ "content": content }))
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let headers = response.headers().clone();
            // The body only matters when the header is missing.
            let body = response.bytes().await.unwrap_or_default();
            let retry_after = ratelimit::retry_after(&headers, &body, self.default_retry_delay);

            warn!(
                destination = %redact(destination),
                retry_after_ms = retry_after.as_millis() as u64,
                "Webhook rate limited"
            );
            return Ok(Attempt::RateLimited { retry_after });
        }

        if status.is_success() {
            let reset_after = ratelimit::reset_after(response.headers());
            debug!(
                status = %status,
                reset_after_ms = reset_after.map(|d| d.as_millis() as u64),
                "Webhook accepted"
            );
            return Ok(Attempt::Delivered { reset_after });
        }

        warn!(
            destination = %redact(destination),
            status = %status,
            "Webhook returned error status"
        );
        Err(DeliveryError::Status(status.as_u16()))
    }
}
