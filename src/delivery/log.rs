//! Log deliverer - writes payloads to the log instead of sending them.
//!
//! Used for dry runs: the whole pipeline (admission, queue, pacing) runs as
//! usual but nothing leaves the machine.

use async_trait::async_trait;
use tracing::info;

use super::{Attempt, Deliver, DeliveryError};
use crate::destination::redact;

/// A deliverer that logs every payload and reports success.
#[derive(Debug, Clone, Default)]
pub struct LogDeliverer;

impl LogDeliverer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Deliver for LogDeliverer {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, destination: &str, content: &str) -> Result<Attempt, DeliveryError> {
        info!(
            destination = %redact(destination),
            content = %content,
            "[dry-run] Would deliver message"
        );

        Ok(Attempt::Delivered { reset_after: None })
    }
}
