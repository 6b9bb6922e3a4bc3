//! Command-line arguments.
//!
//! Defined in the library so the override logic can be tested without
//! spawning the binary.

use std::path::PathBuf;

use clap::Parser;

use crate::config::RelayConfig;

/// Forwards chat messages to a Discord webhook.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "chat-relay", version, about)]
pub struct Cli {
    /// Listen address (overrides `server.host`)
    #[arg(long)]
    pub host: Option<String>,

    /// HTTP port (overrides `server.port`)
    #[arg(long)]
    pub port: Option<u16>,

    /// TOML config file [env: CHAT_RELAY_CONFIG]
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// JSON file the webhook URL is stored in (overrides `destination.file`)
    #[arg(long)]
    pub destination_file: Option<PathBuf>,

    /// Log messages instead of sending them
    #[arg(long)]
    pub dry_run: bool,

    /// Enable debug logging
    #[arg(long, short)]
    pub verbose: bool,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded configuration.
    pub fn apply(&self, config: &mut RelayConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(file) = &self.destination_file {
            config.destination.file = file.clone();
        }
        if self.dry_run {
            config.delivery.dry_run = true;
        }
    }

    /// Default log filter when `RUST_LOG` is not set.
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "chat_relay=debug,info"
        } else {
            "info"
        }
    }
}
