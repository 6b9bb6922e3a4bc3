//! The delivery worker.
//!
//! Exactly one worker drains the queue. It sends one payload at a time so
//! messages reach the destination in the order they were admitted, and so
//! pacing and backoff are plain fields with no locking.
//!
//! ```text
//! WAITING --payload--> SENDING --2xx--> PACING ------------> WAITING
//!                         |  \--error-> BACKOFF -----------> WAITING
//!                         \--429--> RATE_LIMITED --> SENDING (once)
//! shutdown flag seen while WAITING --> STOPPED
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{Attempt, Deliver, DeliveryError};
use crate::destination::Destination;
use crate::event::Payload;
use crate::metrics::Metrics;
use crate::queue::{Dequeued, QueueReceiver};
use crate::ratelimit::{Backoff, INITIAL_BACKOFF, MAX_BACKOFF};
use crate::shutdown::ShutdownSignal;

/// Timing knobs for the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Minimum gap between successful sends
    pub base_spacing: Duration,
    /// How long one dequeue waits before re-checking shutdown
    pub dequeue_timeout: Duration,
    /// Upper bound on a single outbound attempt
    pub attempt_timeout: Duration,
    /// Floor applied to a 429 retry delay
    pub min_retry_delay: Duration,
    /// Delay after the first failure
    pub initial_backoff: Duration,
    /// Ceiling for the failure backoff
    pub max_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            base_spacing: Duration::from_millis(450),
            dequeue_timeout: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(10),
            min_retry_delay: Duration::from_millis(500),
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }
}

/// What the worker is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Waiting,
    Sending,
    RateLimited,
    Pacing,
    Backoff,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Waiting => "waiting",
            WorkerState::Sending => "sending",
            WorkerState::RateLimited => "rate_limited",
            WorkerState::Pacing => "pacing",
            WorkerState::Backoff => "backoff",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Totals for one worker run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub delivered: u64,
    pub failed: u64,
    pub rate_limited: u64,
}

/// Single consumer of the delivery queue.
pub struct DeliveryWorker {
    queue: QueueReceiver,
    deliverer: Arc<dyn Deliver>,
    destination: Destination,
    config: WorkerConfig,
    shutdown: ShutdownSignal,
    metrics: Arc<Metrics>,
    state: watch::Sender<WorkerState>,
    backoff: Backoff,
    stats: WorkerStats,
}

impl DeliveryWorker {
    pub fn new(
        queue: QueueReceiver,
        deliverer: Arc<dyn Deliver>,
        destination: Destination,
        config: WorkerConfig,
        shutdown: ShutdownSignal,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Waiting);
        let backoff = Backoff::new(config.initial_backoff, config.max_backoff);

        Self {
            queue,
            deliverer,
            destination,
            config,
            shutdown,
            metrics,
            state,
            backoff,
            stats: WorkerStats::default(),
        }
    }

    /// Watch the worker's state.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Run the worker on the tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let state = self.subscribe();
        let shutdown = self.shutdown.clone();
        let join = tokio::spawn(self.run());

        WorkerHandle {
            join,
            shutdown,
            state,
        }
    }

    /// Drain the queue until shutdown or until every sender is gone.
    pub async fn run(mut self) -> WorkerStats {
        info!(
            deliverer = %self.deliverer.name(),
            base_spacing_ms = self.config.base_spacing.as_millis() as u64,
            "Delivery worker started"
        );

        while !self.shutdown.is_shutdown() {
            self.set_state(WorkerState::Waiting);

            let payload = match self.queue.dequeue(self.config.dequeue_timeout).await {
                Dequeued::Item(payload) => payload,
                Dequeued::Empty => continue,
                Dequeued::Closed => {
                    info!("Delivery queue closed");
                    break;
                }
            };

            self.process(payload).await;
        }

        self.set_state(WorkerState::Stopped);
        info!(
            delivered = self.stats.delivered,
            failed = self.stats.failed,
            rate_limited = self.stats.rate_limited,
            "Delivery worker stopped"
        );

        self.stats
    }

    /// Deliver one payload, then pace or back off.
    async fn process(&mut self, payload: Payload) {
        let started = Instant::now();

        match self.send(&payload).await {
            Ok(reset_after) => {
                self.backoff.reset();
                self.stats.delivered += 1;
                self.metrics.record_delivered();

                let spacing = match reset_after {
                    Some(hint) => hint.max(self.config.base_spacing),
                    None => self.config.base_spacing,
                };

                info!(
                    payload_id = %payload.id(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    spacing_ms = spacing.as_millis() as u64,
                    "Message delivered"
                );

                self.set_state(WorkerState::Pacing);
                self.shutdown.sleep(spacing).await;
            }
            Err(e) => {
                let delay = self.backoff.fail();
                self.stats.failed += 1;
                self.metrics.record_failed();

                match e {
                    DeliveryError::Destination => error!(
                        payload_id = %payload.id(),
                        backoff_ms = delay.as_millis() as u64,
                        "Destination not configured, message dropped"
                    ),
                    _ => warn!(
                        payload_id = %payload.id(),
                        error = %e,
                        kind = e.kind(),
                        backoff_ms = delay.as_millis() as u64,
                        "Delivery failed, message dropped"
                    ),
                }

                self.set_state(WorkerState::Backoff);
                self.shutdown.sleep(delay).await;
            }
        }
    }

    /// Send with at most one retry after a 429.
    ///
    /// Returns the destination's pacing hint on success.
    async fn send(&mut self, payload: &Payload) -> Result<Option<Duration>, DeliveryError> {
        let destination = self.destination.resolve();
        if !self.destination.is_valid(&destination) {
            return Err(DeliveryError::Destination);
        }

        let retry_after = match self.attempt(&destination, payload).await? {
            Attempt::Delivered { reset_after } => return Ok(reset_after),
            Attempt::RateLimited { retry_after } => retry_after,
        };

        let delay = retry_after.max(self.config.min_retry_delay);
        debug!(
            payload_id = %payload.id(),
            delay_ms = delay.as_millis() as u64,
            "Rate limited, retrying once"
        );
        self.set_state(WorkerState::RateLimited);
        tokio::time::sleep(delay).await;

        match self.attempt(&destination, payload).await? {
            Attempt::Delivered { reset_after } => Ok(reset_after),
            Attempt::RateLimited { retry_after } => Err(DeliveryError::RateLimited { retry_after }),
        }
    }

    /// One bounded outbound attempt.
    async fn attempt(&mut self, destination: &str, payload: &Payload) -> Result<Attempt, DeliveryError> {
        self.set_state(WorkerState::Sending);

        let result = match tokio::time::timeout(
            self.config.attempt_timeout,
            self.deliverer.deliver(destination, payload.content()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.config.attempt_timeout)),
        };

        if let Ok(Attempt::RateLimited { .. }) = result {
            self.stats.rate_limited += 1;
            self.metrics.record_rate_limited();
        }

        result
    }

    fn set_state(&self, next: WorkerState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = %current, to = %next, "Worker state change");
            *current = next;
            true
        });
    }
}

/// Handle to a spawned [`DeliveryWorker`].
#[derive(Debug)]
pub struct WorkerHandle {
    join: JoinHandle<WorkerStats>,
    shutdown: ShutdownSignal,
    state: watch::Receiver<WorkerState>,
}

impl WorkerHandle {
    /// Current worker state
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch the worker's state.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Ask the worker to stop and wait up to the signal's timeout.
    pub async fn shutdown(self) -> Option<WorkerStats> {
        self.shutdown.trigger();
        let timeout = self.shutdown.timeout();
        self.join(timeout).await
    }

    /// Wait for the worker to finish, aborting it after `timeout`.
    pub async fn join(self, timeout: Duration) -> Option<WorkerStats> {
        let abort = self.join.abort_handle();

        match tokio::time::timeout(timeout, self.join).await {
            Ok(Ok(stats)) => Some(stats),
            Ok(Err(e)) => {
                error!(error = %e, "Delivery worker task failed");
                None
            }
            Err(_) => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "Delivery worker did not stop in time, aborting"
                );
                abort.abort();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::DestinationPolicy;
    use crate::queue::{self, QueueSender};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const VALID: &str = "https://discord.com/api/webhooks/1/token";

    enum Step {
        Reply(Result<Attempt, DeliveryError>),
        Hang,
    }

    fn ok() -> Step {
        Step::Reply(Ok(Attempt::Delivered { reset_after: None }))
    }

    fn ok_with_hint(hint: Duration) -> Step {
        Step::Reply(Ok(Attempt::Delivered {
            reset_after: Some(hint),
        }))
    }

    fn limited(secs: f64) -> Step {
        Step::Reply(Ok(Attempt::RateLimited {
            retry_after: Duration::from_secs_f64(secs),
        }))
    }

    fn fail() -> Step {
        Step::Reply(Err(DeliveryError::Status(500)))
    }

    /// Replays a fixed script and records when each call happened.
    /// Once the script runs out every call succeeds.
    struct Scripted {
        steps: Mutex<VecDeque<Step>>,
        calls: Mutex<Vec<(Instant, String)>>,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(Instant, String)> {
            self.calls.lock().unwrap().clone()
        }

        fn gaps(&self) -> Vec<Duration> {
            self.calls()
                .windows(2)
                .map(|pair| pair[1].0 - pair[0].0)
                .collect()
        }
    }

    #[async_trait]
    impl Deliver for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn deliver(&self, _destination: &str, content: &str) -> Result<Attempt, DeliveryError> {
            self.calls
                .lock()
                .unwrap()
                .push((Instant::now(), content.to_string()));

            let step = self.steps.lock().unwrap().pop_front().unwrap_or_else(ok);
            match step {
                Step::Reply(result) => result,
                Step::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    struct Harness {
        tx: QueueSender,
        handle: WorkerHandle,
        deliverer: Arc<Scripted>,
        metrics: Arc<Metrics>,
    }

    impl Harness {
        fn start(steps: Vec<Step>) -> Self {
            Self::start_with(steps, VALID)
        }

        fn start_with(steps: Vec<Step>, destination: &str) -> Self {
            let (tx, rx) = queue::channel(16);
            let deliverer = Scripted::new(steps);
            let metrics = Arc::new(Metrics::new());
            let worker = DeliveryWorker::new(
                rx,
                deliverer.clone(),
                Destination::new(destination, DestinationPolicy::default()),
                WorkerConfig::default(),
                ShutdownSignal::with_timeout(Duration::from_secs(5)),
                metrics.clone(),
            );

            Self {
                tx,
                handle: worker.spawn(),
                deliverer,
                metrics,
            }
        }

        fn send(&self, messages: &[&str]) {
            for message in messages {
                self.tx.enqueue(Payload::from_content(*message)).unwrap();
            }
        }

        async fn wait_for_calls(&self, count: usize) {
            for _ in 0..100_000 {
                if self.deliverer.calls().len() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!(
                "expected {} calls, saw {}",
                count,
                self.deliverer.calls().len()
            );
        }

        /// Let the worker finish whatever sleep follows the last call.
        async fn settle(&self) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
    }

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    fn assert_gap(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(50),
            "gap {:?}, expected about {:?}",
            actual,
            expected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_in_order_with_base_spacing() {
        let harness = Harness::start(vec![]);
        harness.send(&["one", "two", "three"]);
        harness.wait_for_calls(3).await;

        let contents: Vec<String> = harness.deliverer.calls().into_iter().map(|c| c.1).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
        for gap in harness.deliverer.gaps() {
            assert_gap(gap, Duration::from_millis(450));
        }

        let stats = harness.handle.shutdown().await.unwrap();
        assert_eq!(stats.delivered, 3);
        assert_eq!(harness.metrics.snapshot().delivered, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_after_hint_extends_spacing() {
        let harness = Harness::start(vec![ok_with_hint(secs(2.0)), ok_with_hint(secs(0.1))]);
        harness.send(&["one", "two", "three"]);
        harness.wait_for_calls(3).await;

        let gaps = harness.deliverer.gaps();
        assert_gap(gaps[0], secs(2.0));
        assert_gap(gaps[1], secs(0.45));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_retries_once_after_delay() {
        let harness = Harness::start(vec![limited(2.0), ok()]);
        harness.send(&["one"]);
        harness.wait_for_calls(2).await;
        harness.settle().await;

        let calls = harness.deliverer.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, calls[1].1);
        assert_gap(harness.deliverer.gaps()[0], secs(2.0));

        let stats = harness.handle.shutdown().await.unwrap();
        assert_eq!(
            stats,
            WorkerStats {
                delivered: 1,
                failed: 0,
                rate_limited: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_rate_limit_is_final() {
        let harness = Harness::start(vec![limited(2.0), limited(2.0)]);
        harness.send(&["one", "two"]);
        harness.wait_for_calls(3).await;
        harness.settle().await;

        let calls = harness.deliverer.calls();
        let contents: Vec<&str> = calls.iter().map(|c| c.1.as_str()).collect();
        assert_eq!(contents, vec!["one", "one", "two"]);

        let gaps = harness.deliverer.gaps();
        assert_gap(gaps[0], secs(2.0));
        // failure backoff before the next payload
        assert_gap(gaps[1], secs(1.0));

        let stats = harness.handle.shutdown().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.rate_limited, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delay_has_floor() {
        let harness = Harness::start(vec![limited(0.0)]);
        harness.send(&["one"]);
        harness.wait_for_calls(2).await;

        assert_gap(harness.deliverer.gaps()[0], secs(0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_and_resets() {
        let harness = Harness::start(vec![fail(), fail(), fail(), fail(), fail(), ok(), fail(), ok()]);
        harness.send(&["1", "2", "3", "4", "5", "6", "7", "8"]);
        harness.wait_for_calls(8).await;

        let gaps = harness.deliverer.gaps();
        let expected = [1.0, 2.0, 4.0, 8.0, 16.0, 0.45, 1.0];
        for (gap, want) in gaps.iter().zip(expected) {
            assert_gap(*gap, secs(want));
        }

        let stats = harness.handle.shutdown().await.unwrap();
        assert_eq!(stats.failed, 6);
        assert_eq!(stats.delivered, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_caps_at_max() {
        let harness = Harness::start((0..7).map(|_| fail()).collect());
        harness.send(&["1", "2", "3", "4", "5", "6", "7", "8"]);
        harness.wait_for_calls(8).await;

        let gaps = harness.deliverer.gaps();
        assert_gap(gaps[5], secs(30.0));
        assert_gap(gaps[6], secs(30.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_payload_not_requeued() {
        let harness = Harness::start(vec![fail()]);
        harness.send(&["one"]);
        harness.wait_for_calls(1).await;
        harness.settle().await;

        assert_eq!(harness.deliverer.calls().len(), 1);
        assert_eq!(harness.metrics.snapshot().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_destination_never_sends() {
        let harness = Harness::start_with(vec![], "");
        harness.send(&["one"]);
        harness.settle().await;

        assert!(harness.deliverer.calls().is_empty());
        let stats = harness.handle.shutdown().await.unwrap();
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_attempt_times_out() {
        let harness = Harness::start(vec![Step::Hang]);
        harness.send(&["one", "two"]);
        harness.wait_for_calls(2).await;

        // 10s attempt timeout, then 1s backoff
        assert_gap(harness.deliverer.gaps()[0], secs(11.0));

        let stats = harness.handle.shutdown().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_idle() {
        let harness = Harness::start(vec![]);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(harness.handle.state(), WorkerState::Waiting);

        let mut state = harness.handle.subscribe();
        let started = Instant::now();
        let stats = harness.handle.shutdown().await.unwrap();

        assert_eq!(stats, WorkerStats::default());
        assert!(started.elapsed() <= Duration::from_millis(500));
        assert_eq!(*state.borrow_and_update(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cuts_backoff_short() {
        let harness = Harness::start((0..6).map(|_| fail()).collect());
        harness.send(&["1", "2", "3", "4", "5", "6"]);
        harness.wait_for_calls(6).await;
        assert_eq!(harness.handle.state(), WorkerState::Backoff);

        let started = Instant::now();
        harness.handle.shutdown().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_queue_closed() {
        let Harness { tx, handle, .. } = Harness::start(vec![]);
        drop(tx);

        let stats = handle.join(Duration::from_secs(5)).await;
        assert_eq!(stats, Some(WorkerStats::default()));
    }
}
