//! Bounded delivery queue between the admission endpoint and the worker.
//!
//! Enqueue never waits: it either takes the payload or hands it back as
//! [`EnqueueError::Full`]. Dequeue waits at most the given timeout so the
//! worker can notice shutdown between messages.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::event::Payload;

/// Default number of payloads the queue can hold.
pub const DEFAULT_QUEUE_CAPACITY: usize = 500;

/// Errors returned by [`QueueSender::enqueue`].
///
/// Both variants give the rejected payload back to the caller.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("delivery queue is full")]
    Full(Payload),

    #[error("delivery queue is closed")]
    Closed(Payload),
}

/// Result of a timed dequeue.
#[derive(Debug)]
pub enum Dequeued {
    /// The oldest pending payload
    Item(Payload),
    /// Nothing arrived before the timeout
    Empty,
    /// Every sender is gone and the queue is drained
    Closed,
}

/// Create a queue holding at most `capacity` payloads.
///
/// # Panics
///
/// Panics if `capacity` is zero. Configuration validation rejects that
/// value before it gets here.
pub fn channel(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (QueueSender { tx }, QueueReceiver { rx })
}

/// Producer half, cloned into every request handler.
#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<Payload>,
}

impl QueueSender {
    /// Add a payload without waiting.
    pub fn enqueue(&self, payload: Payload) -> Result<(), EnqueueError> {
        self.tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(p) => EnqueueError::Full(p),
            mpsc::error::TrySendError::Closed(p) => EnqueueError::Closed(p),
        })
    }

    /// Number of payloads currently waiting
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of payloads the queue holds
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

/// Consumer half, owned by the single delivery worker.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<Payload>,
}

impl QueueReceiver {
    /// Wait up to `timeout` for the next payload.
    pub async fn dequeue(&mut self, timeout: Duration) -> Dequeued {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(payload)) => Dequeued::Item(payload),
            Ok(None) => Dequeued::Closed,
            Err(_) => Dequeued::Empty,
        }
    }
}
