//! Rate-limit hints and the failure backoff schedule.
//!
//! Discord answers a throttled request with `429 Too Many Requests` and says
//! how long to wait either in a `Retry-After` header or in a `retry_after`
//! field of the JSON body. Successful responses may carry
//! `X-RateLimit-Reset-After`, which the worker uses as a pacing hint.

use std::time::Duration;

use reqwest::header::HeaderMap;
use serde_json::Value;

/// Header carrying the retry delay on a 429 response.
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Header carrying the bucket reset delay on successful responses.
pub const RESET_AFTER_HEADER: &str = "x-ratelimit-reset-after";

/// Delay assumed when a 429 response does not say how long to wait.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Delay after the first failure.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Longest delay the backoff schedule reaches.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Parse a non-negative, possibly fractional, number of seconds.
pub fn parse_seconds(value: &str) -> Option<Duration> {
    let seconds: f64 = value.trim().parse().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}

/// `retry_after` from a JSON error body, as a number or numeric string.
///
/// Negative values count as zero so the caller's floor applies.
fn body_seconds(body: &[u8]) -> Option<Duration> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let seconds = match value.get("retry_after")? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !seconds.is_finite() {
        return None;
    }
    Duration::try_from_secs_f64(seconds.max(0.0)).ok()
}

fn header_seconds(headers: &HeaderMap, name: &str) -> Option<Duration> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_seconds)
}

/// Work out how long a 429 response asks us to wait.
///
/// The header wins when it parses; otherwise the body's `retry_after`;
/// otherwise `default`.
pub fn retry_after(headers: &HeaderMap, body: &[u8], default: Duration) -> Duration {
    if let Some(delay) = header_seconds(headers, RETRY_AFTER_HEADER) {
        return delay;
    }

    body_seconds(body).unwrap_or(default)
}

/// Pacing hint from a successful response, if present and parseable.
pub fn reset_after(headers: &HeaderMap) -> Option<Duration> {
    header_seconds(headers, RESET_AFTER_HEADER)
}

/// Doubling delay applied after consecutive delivery failures.
///
/// The first failure waits `initial`, each further one doubles the wait up
/// to `max`, and a success resets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: Duration::ZERO,
            initial,
            max: max.max(initial),
        }
    }

    /// Record a failure and return how long to wait.
    pub fn fail(&mut self) -> Duration {
        self.current = if self.current.is_zero() {
            self.initial
        } else {
            self.current.saturating_mul(2).min(self.max)
        };
        self.current
    }

    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }

    /// Delay applied after the most recent failure; zero after a success.
    pub fn current(&self) -> Duration {
        self.current
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}
