//! Configuration module for the relay.
//!
//! Loads configuration from a TOML file with environment variable
//! substitution. Every field has a default, so a missing file is fine.
//!
//! # Example
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8000
//!
//! [destination]
//! url = "${DISCORD_WEBHOOK_URL}"
//! file = "config.json"
//!
//! [delivery]
//! queue_capacity = 500
//! base_spacing_ms = 450
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::delivery::WorkerConfig;
use crate::destination::{DestinationPolicy, DEFAULT_ALLOWED_PREFIXES, DEFAULT_DESTINATION_FILE};
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::ratelimit::INITIAL_BACKOFF;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "CHAT_RELAY_CONFIG";

/// Config file used when neither `--config` nor [`CONFIG_ENV_VAR`] is set.
pub const DEFAULT_CONFIG_PATH: &str = "config/chat-relay.toml";

static ENV_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
});

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub destination: DestinationConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,
}

/// HTTP listener configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

/// Where the webhook address comes from and what counts as valid
#[derive(Debug, Deserialize, Clone)]
pub struct DestinationConfig {
    /// Webhook URL; takes precedence over the destination file
    #[serde(default)]
    pub url: Option<String>,

    /// JSON file holding `discord_webhook_url`
    #[serde(default = "default_destination_file")]
    pub file: PathBuf,

    #[serde(default = "default_allowed_prefixes")]
    pub allowed_prefixes: Vec<String>,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            url: None,
            file: default_destination_file(),
            allowed_prefixes: default_allowed_prefixes(),
        }
    }
}

fn default_destination_file() -> PathBuf {
    PathBuf::from(DEFAULT_DESTINATION_FILE)
}

fn default_allowed_prefixes() -> Vec<String> {
    DEFAULT_ALLOWED_PREFIXES.iter().map(|s| s.to_string()).collect()
}

/// Queue, pacing and retry tuning
#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_base_spacing_ms")]
    pub base_spacing_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_dequeue_timeout_ms")]
    pub dequeue_timeout_ms: u64,

    #[serde(default = "default_min_retry_delay_ms")]
    pub min_retry_delay_ms: u64,

    #[serde(default = "default_retry_delay_ms")]
    pub default_retry_delay_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Log payloads instead of sending them
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            base_spacing_ms: default_base_spacing_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            dequeue_timeout_ms: default_dequeue_timeout_ms(),
            min_retry_delay_ms: default_min_retry_delay_ms(),
            default_retry_delay_ms: default_retry_delay_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            dry_run: false,
        }
    }
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_base_spacing_ms() -> u64 {
    450
}

fn default_request_timeout_ms() -> u64 {
    10000
}

fn default_dequeue_timeout_ms() -> u64 {
    500
}

fn default_min_retry_delay_ms() -> u64 {
    500
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30000
}

impl DeliveryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn default_retry_delay(&self) -> Duration {
        Duration::from_millis(self.default_retry_delay_ms)
    }

    /// Worker timings derived from this section.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            base_spacing: Duration::from_millis(self.base_spacing_ms),
            dequeue_timeout: Duration::from_millis(self.dequeue_timeout_ms),
            attempt_timeout: self.request_timeout(),
            min_retry_delay: Duration::from_millis(self.min_retry_delay_ms),
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

impl RelayConfig {
    /// Load configuration from `path`, [`CONFIG_ENV_VAR`], or the default path.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from(path),
            None => {
                let config_path =
                    env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
                Self::load_from(config_path)
            }
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;

        info!(
            port = config.server.port,
            queue_capacity = config.delivery.queue_capacity,
            dry_run = config.delivery.dry_run,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Parse and validate TOML text after substituting `${VAR}` placeholders.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);

        debug!("Parsing TOML configuration");
        let config: RelayConfig = toml::from_str(&content)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let delivery = &self.delivery;

        if delivery.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "delivery.queue_capacity must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            ("request_timeout_ms", delivery.request_timeout_ms),
            ("dequeue_timeout_ms", delivery.dequeue_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "delivery.{} must be greater than 0",
                    name
                )));
            }
        }

        if Duration::from_millis(delivery.max_backoff_ms) < INITIAL_BACKOFF {
            return Err(ConfigError::ValidationError(format!(
                "delivery.max_backoff_ms must be at least {}",
                INITIAL_BACKOFF.as_millis()
            )));
        }

        if self.destination.allowed_prefixes.is_empty() {
            return Err(ConfigError::ValidationError(
                "destination.allowed_prefixes must not be empty".to_string(),
            ));
        }

        for prefix in &self.destination.allowed_prefixes {
            if !prefix.starts_with("http://") && !prefix.starts_with("https://") {
                return Err(ConfigError::ValidationError(format!(
                    "Allowed prefix '{}' must start with http:// or https://",
                    prefix
                )));
            }
        }

        if let Some(url) = &self.destination.url {
            if url.contains("${") {
                warn!("destination.url contains unsubstituted environment variable");
            } else if !url.is_empty() && !self.policy().is_valid(url) {
                return Err(ConfigError::ValidationError(
                    "destination.url does not match any allowed prefix".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Destination validation rules.
    pub fn policy(&self) -> DestinationPolicy {
        DestinationPolicy::new(self.destination.allowed_prefixes.iter().cloned())
    }

    /// The configured webhook URL, if it is set and fully substituted.
    pub fn configured_url(&self) -> Option<&str> {
        self.destination
            .url
            .as_deref()
            .filter(|url| !url.is_empty() && !url.contains("${"))
    }

    /// `host:port` to bind.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    ENV_PLACEHOLDER
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                    caps[0].to_string()
                }
            }
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("CHAT_RELAY_TEST_VAR", "substituted_value");
        let input = "url = \"${CHAT_RELAY_TEST_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"substituted_value\"");
        env::remove_var("CHAT_RELAY_TEST_VAR");
    }

    #[test]
    fn test_env_var_not_set() {
        let input = "url = \"${CHAT_RELAY_NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"${CHAT_RELAY_NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.listen_addr(), "127.0.0.1:8000");
        assert_eq!(config.destination.file, PathBuf::from("config.json"));
        assert_eq!(config.delivery.queue_capacity, 500);
        assert!(config.configured_url().is_none());
        assert!(config.validate().is_ok());

        let worker = config.delivery.worker_config();
        assert_eq!(worker, WorkerConfig::default());
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = RelayConfig::from_toml(
            r#"
            [server]
            port = 4000
        "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.delivery.base_spacing_ms, 450);
    }

    #[test]
    fn test_parse_full_config() {
        let config = RelayConfig::from_toml(
            r#"
            [server]
            host = "0.0.0.0"
            port = 9000

            [destination]
            url = "https://discord.com/api/webhooks/1/abc"
            file = "state/webhook.json"

            [delivery]
            queue_capacity = 50
            base_spacing_ms = 1000
            request_timeout_ms = 5000
            max_backoff_ms = 60000
            dry_run = true
        "#,
        )
        .unwrap();

        assert_eq!(config.listen_addr(), "0.0.0.0:9000");
        assert_eq!(config.configured_url(), Some("https://discord.com/api/webhooks/1/abc"));
        assert_eq!(config.destination.file, PathBuf::from("state/webhook.json"));
        assert!(config.delivery.dry_run);

        let worker = config.delivery.worker_config();
        assert_eq!(worker.base_spacing, Duration::from_secs(1));
        assert_eq!(worker.attempt_timeout, Duration::from_secs(5));
        assert_eq!(worker.max_backoff, Duration::from_secs(60));
    }

    #[test]
    fn test_unsubstituted_url_is_not_configured() {
        let config = RelayConfig::from_toml(
            r#"
            [destination]
            url = "${CHAT_RELAY_MISSING_WEBHOOK}"
        "#,
        )
        .unwrap();
        assert!(config.configured_url().is_none());
    }

    #[test]
    fn test_custom_prefixes() {
        let config = RelayConfig::from_toml(
            r#"
            [destination]
            url = "http://127.0.0.1:9999/hook/1"
            allowed_prefixes = ["http://127.0.0.1:9999/hook/"]
        "#,
        )
        .unwrap();
        assert!(config.policy().is_valid("http://127.0.0.1:9999/hook/1"));
        assert!(!config.policy().is_valid("https://discord.com/api/webhooks/1/x"));
    }

    #[test]
    fn test_validation_url_outside_prefixes() {
        let result = RelayConfig::from_toml(
            r#"
            [destination]
            url = "https://example.com/hook"
        "#,
        );
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_zero_capacity() {
        let result = RelayConfig::from_toml(
            r#"
            [delivery]
            queue_capacity = 0
        "#,
        );
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_bad_prefix() {
        let result = RelayConfig::from_toml(
            r#"
            [destination]
            allowed_prefixes = ["discord.com/api/webhooks/"]
        "#,
        );
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_small_max_backoff() {
        let result = RelayConfig::from_toml(
            r#"
            [delivery]
            max_backoff_ms = 10
        "#,
        );
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        fs::write(&path, "[server]\nport = 8123\n").unwrap();

        let config = RelayConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 8123);
    }

    #[test]
    fn test_parse_error() {
        let result = RelayConfig::from_toml("[server\nport = 1");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
