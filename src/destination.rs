//! Destination webhook address: validation, shared cell, and on-disk store.
//!
//! The address is read by every admission request and by the worker before
//! each send. It changes rarely (first-run setup, or an operator fixing the
//! config file while the relay runs) and the last write wins.

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default file the webhook address is persisted in.
pub const DEFAULT_DESTINATION_FILE: &str = "config.json";

/// Address prefixes accepted when none are configured.
pub const DEFAULT_ALLOWED_PREFIXES: &[&str] = &[
    "https://discord.com/api/webhooks/",
    "https://discordapp.com/api/webhooks/",
    "https://ptb.discord.com/api/webhooks/",
    "https://canary.discord.com/api/webhooks/",
];

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize destination file: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("no candidate location to save the destination to")]
    NoLocation,

    #[error("input closed before a valid webhook URL was entered")]
    PromptClosed,

    #[error("failed to read input: {0}")]
    Prompt(#[from] io::Error),
}

/// Which addresses count as a usable destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationPolicy {
    prefixes: Vec<String>,
}

impl DestinationPolicy {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `url` starts with one of the accepted prefixes and has
    /// something after it.
    pub fn is_valid(&self, url: &str) -> bool {
        self.prefixes
            .iter()
            .any(|prefix| url.len() > prefix.len() && url.starts_with(prefix.as_str()))
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }
}

impl Default for DestinationPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_PREFIXES.iter().copied())
    }
}

/// On-disk format of the destination file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DestinationFile {
    #[serde(default)]
    discord_webhook_url: String,
}

/// Reads and writes the webhook address from an ordered list of files.
///
/// The first candidate is the primary location and is where [`save`]
/// writes. Later candidates are only read.
///
/// [`save`]: DestinationStore::save
#[derive(Debug, Clone, Default)]
pub struct DestinationStore {
    candidates: Vec<PathBuf>,
}

impl DestinationStore {
    pub fn new<I, P>(candidates: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            candidates: candidates.into_iter().map(Into::into).collect(),
        }
    }

    /// Store that looks at `file` (relative to the working directory) and
    /// then at the same file name beside the running executable.
    pub fn with_default_candidates(file: impl AsRef<Path>) -> Self {
        let file = file.as_ref();
        let mut candidates = vec![file.to_path_buf()];

        if file.is_relative() {
            if let Some(exe_dir) = std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf))
            {
                let beside_exe = exe_dir.join(file);
                if !candidates.contains(&beside_exe) {
                    candidates.push(beside_exe);
                }
            }
        }

        Self { candidates }
    }

    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    /// Return the first non-empty address found, or `None`.
    ///
    /// Missing files are skipped silently; unreadable or malformed ones are
    /// skipped with a warning.
    pub fn load(&self) -> Option<String> {
        for path in &self.candidates {
            if !path.exists() {
                continue;
            }

            let content = match fs::read_to_string(path) {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read destination file");
                    continue;
                }
            };

            match serde_json::from_str::<DestinationFile>(&content) {
                Ok(file) if !file.discord_webhook_url.trim().is_empty() => {
                    debug!(path = %path.display(), "Loaded destination from file");
                    return Some(file.discord_webhook_url.trim().to_string());
                }
                Ok(_) => {
                    debug!(path = %path.display(), "Destination file has no webhook URL");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Malformed destination file");
                }
            }
        }

        None
    }

    /// Persist `url` to the primary candidate.
    pub fn save(&self, url: &str) -> Result<PathBuf, DestinationError> {
        let path = self
            .candidates
            .first()
            .ok_or(DestinationError::NoLocation)?;

        let content = serde_json::to_string_pretty(&DestinationFile {
            discord_webhook_url: url.to_string(),
        })?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| DestinationError::Write {
                path: path.clone(),
                source,
            })?;
        }

        fs::write(path, content).map_err(|source| DestinationError::Write {
            path: path.clone(),
            source,
        })?;

        info!(path = %path.display(), "Webhook URL saved");
        Ok(path.clone())
    }
}

/// Shared, cached destination address.
///
/// Cheap to clone; all clones see the same value.
#[derive(Debug, Clone)]
pub struct Destination {
    current: Arc<RwLock<String>>,
    policy: DestinationPolicy,
    store: Option<DestinationStore>,
}

impl Destination {
    pub fn new(initial: impl Into<String>, policy: DestinationPolicy) -> Self {
        Self {
            current: Arc::new(RwLock::new(initial.into())),
            policy,
            store: None,
        }
    }

    /// Attach a store that [`reload`](Destination::reload) reads from.
    pub fn with_store(mut self, store: DestinationStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Current address; empty when unset.
    pub fn resolve(&self) -> String {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the current address.
    pub fn set(&self, url: impl Into<String>) {
        let url = url.into();
        debug!(destination = %redact(&url), "Destination updated");
        match self.current.write() {
            Ok(mut guard) => *guard = url,
            Err(poisoned) => *poisoned.into_inner() = url,
        }
    }

    pub fn is_valid(&self, url: &str) -> bool {
        self.policy.is_valid(url)
    }

    /// Whether the current address is usable.
    pub fn is_configured(&self) -> bool {
        self.is_valid(&self.resolve())
    }

    pub fn policy(&self) -> &DestinationPolicy {
        &self.policy
    }

    /// Re-read the store and adopt its address if it is valid.
    ///
    /// Returns whether the destination is configured afterwards.
    pub fn reload(&self) -> bool {
        let Some(store) = &self.store else {
            return self.is_configured();
        };

        match store.load() {
            Some(url) if self.is_valid(&url) => {
                if url != self.resolve() {
                    info!(destination = %redact(&url), "Destination reloaded from file");
                    self.set(url);
                }
                true
            }
            _ => self.is_configured(),
        }
    }
}

/// Ask on `output` for a webhook URL until `input` yields a valid one.
pub fn prompt_for_destination<R, W>(
    mut input: R,
    mut output: W,
    policy: &DestinationPolicy,
) -> Result<String, DestinationError>
where
    R: BufRead,
    W: Write,
{
    writeln!(output, "No valid Discord webhook URL found in config.")?;

    loop {
        write!(output, "Enter your Discord webhook URL: ")?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            return Err(DestinationError::PromptClosed);
        }

        let url = line.trim();
        if policy.is_valid(url) {
            return Ok(url.to_string());
        }

        let expected = policy
            .prefixes()
            .first()
            .map(String::as_str)
            .unwrap_or("https://");
        writeln!(
            output,
            "Invalid URL. Must start with {}... Please try again.",
            expected
        )?;
    }
}

/// Strip the path from a webhook URL so the token never reaches the logs.
pub fn redact(url: &str) -> String {
    if url.is_empty() {
        return "<unset>".to_string();
    }

    match url.split_once("://") {
        Some((scheme, rest)) => {
            let host = rest.split('/').next().unwrap_or("");
            format!("{}://{}/…", scheme, host)
        }
        None => "<invalid>".to_string(),
    }
}
