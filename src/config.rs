//! Configuration loading from `.env` files.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::badges::AggregateOptions;

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Fallback relay set used when the subject advertises none.
    pub relays: Vec<String>,
    /// Relays known to carry NIP-65 relay-list events.
    pub index_relays: Vec<String>,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// Rolling per-read deadline, in milliseconds.
    pub read_timeout_ms: u64,
    /// Total budget for a first-stage fan-out, in milliseconds.
    pub stage_timeout_ms: u64,
    /// Budget for resolving one definition reference, in milliseconds.
    pub resolve_timeout_ms: u64,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        Ok(Self {
            relays: csv_strings(env::var("RELAYS").unwrap_or_default()),
            index_relays: csv_strings(env::var("INDEX_RELAYS").unwrap_or_default()),
            tor_socks: env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty()),
            read_timeout_ms: env_millis("READ_TIMEOUT_MS", 5_000),
            stage_timeout_ms: env_millis("STAGE_TIMEOUT_MS", 10_000),
            resolve_timeout_ms: env_millis("RESOLVE_TIMEOUT_MS", 5_000),
        })
    }

    /// Deadlines and proxy settings for aggregation calls.
    pub fn aggregate_options(&self) -> AggregateOptions {
        AggregateOptions {
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            stage_timeout: Duration::from_millis(self.stage_timeout_ms),
            resolve_timeout: Duration::from_millis(self.resolve_timeout_ms),
            socks: self.tor_socks.clone(),
        }
    }
}

/// Read a millisecond value, falling back to `default` when absent or invalid.
fn env_millis(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

/// Serializes tests that mutate process-wide environment variables.
#[cfg(test)]
pub static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());
