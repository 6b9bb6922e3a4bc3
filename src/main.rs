use std::io::{self, IsTerminal};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chat_relay::api::{self, AppState};
use chat_relay::cli::Cli;
use chat_relay::config::RelayConfig;
use chat_relay::delivery::{Deliver, DeliveryWorker, LogDeliverer, WebhookClient};
use chat_relay::destination::{self, redact, Destination, DestinationStore};
use chat_relay::metrics::Metrics;
use chat_relay::queue;
use chat_relay::shutdown::ShutdownSignal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // 1. Initialize Logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(version = env!("CARGO_PKG_VERSION"), "Chat relay starting");

    // 2. Setup Configuration
    let mut config = RelayConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    // 3. Resolve the destination
    let store = DestinationStore::with_default_candidates(&config.destination.file);
    let initial = config
        .configured_url()
        .map(str::to_string)
        .or_else(|| store.load())
        .unwrap_or_default();
    let destination = Destination::new(initial, config.policy()).with_store(store.clone());

    if !destination.is_configured() {
        ensure_destination(&destination, &store)?;
    }

    // 4. Start the delivery worker
    let (queue_tx, queue_rx) = queue::channel(config.delivery.queue_capacity);
    let metrics = Arc::new(Metrics::new());
    let shutdown = ShutdownSignal::new();

    let deliverer: Arc<dyn Deliver> = if config.delivery.dry_run {
        warn!("Dry run: messages will be logged, not sent");
        Arc::new(LogDeliverer::new())
    } else {
        Arc::new(
            WebhookClient::new()?
                .with_timeout(config.delivery.request_timeout())
                .with_default_retry_delay(config.delivery.default_retry_delay()),
        )
    };

    let worker = DeliveryWorker::new(
        queue_rx,
        deliverer,
        destination.clone(),
        config.delivery.worker_config(),
        shutdown.clone(),
        metrics.clone(),
    )
    .spawn();

    // 5. Build Router
    let app_state = Arc::new(AppState::new(
        queue_tx,
        destination.clone(),
        metrics,
        worker.subscribe(),
    ));
    let app = api::router(app_state);

    // 6. Start Server
    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        error!(addr = %addr, error = %e, "Failed to bind listener");
        e
    })?;

    info!(
        addr = %addr,
        destination = %redact(&destination.resolve()),
        queue_capacity = config.delivery.queue_capacity,
        "Chat relay listening"
    );

    let server_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.wait().await })
        .await;

    // Stop the worker however the server ended.
    shutdown.trigger();
    match worker.join(shutdown.timeout()).await {
        Some(stats) => info!(
            delivered = stats.delivered,
            failed = stats.failed,
            rate_limited = stats.rate_limited,
            "Chat relay stopped"
        ),
        None => warn!("Chat relay stopped without a clean worker shutdown"),
    }

    served?;
    Ok(())
}

/// Ask for a webhook URL on first run, or warn when nobody can answer.
fn ensure_destination(
    destination: &Destination,
    store: &DestinationStore,
) -> Result<(), destination::DestinationError> {
    if !io::stdin().is_terminal() {
        warn!(
            candidates = ?store.candidates(),
            "No valid Discord webhook URL configured; messages will be rejected until one is set"
        );
        return Ok(());
    }

    let url = destination::prompt_for_destination(
        io::stdin().lock(),
        io::stdout(),
        destination.policy(),
    )?;

    if let Err(e) = store.save(&url) {
        warn!(error = %e, "Failed to save webhook URL, using it for this run only");
    }
    destination.set(url);
    Ok(())
}
