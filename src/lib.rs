//! # Chat Relay
//!
//! Relays chat lines from a game server to a Discord webhook, one at a time
//! and in order, while staying inside the webhook's rate limits.
//!
//! ## Architecture
//!
//! ```text
//! Game server -> GET /webhook -> bounded queue -> delivery worker -> Discord
//! ```
//!
//! ## Modules
//!
//! - [`event`]: Chat event and payload formatting
//! - [`queue`]: Bounded FIFO between the endpoint and the worker
//! - [`api`]: Admission endpoint, health and metrics
//! - [`delivery`]: Outbound client and the delivery worker
//! - [`ratelimit`]: Retry-after parsing and backoff schedule
//! - [`destination`]: Webhook address validation and storage

pub mod api;
pub mod cli;
pub mod config;
pub mod delivery;
pub mod destination;
pub mod event;
pub mod metrics;
pub mod queue;
pub mod ratelimit;
pub mod shutdown;

// Re-export commonly used types at crate root
pub use delivery::{Attempt, Deliver, DeliveryError, DeliveryWorker, WorkerHandle, WorkerState};
pub use destination::{Destination, DestinationPolicy, DestinationStore};
pub use event::{ChatEvent, Payload};
