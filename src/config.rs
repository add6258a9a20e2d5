use serde::Deserialize;
use std::{fs, path::Path};
use anyhow::{Context, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: Storage,
    #[serde(default)]
    pub scan: Scan,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub log: Log,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Storage {
    /// Wallet database directory
    pub path: String,
    /// Block store written by the node; defaults to `<path>/chain`
    #[serde(default)]
    pub chain_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Scan {
    /// Tolerance subtracted from the earliest birth time before it is mapped to a height.
    #[serde(default = "default_rescan_window")]
    pub rescan_window_secs: u64,
    /// Attempts per block when the chain reports a transient read failure.
    #[serde(default = "default_read_retries")]
    pub read_retries: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Metrics {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Log {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for Scan {
    fn default() -> Self {
        Self {
            rescan_window_secs: default_rescan_window(),
            read_retries: default_read_retries(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self { enabled: false, bind: default_bind() }
    }
}

impl Default for Log {
    fn default() -> Self {
        Self { level: default_level() }
    }
}

fn default_rescan_window() -> u64 { 2 * 60 * 60 }   // 2 hours
fn default_read_retries() -> u32  { 3 }
fn default_retry_backoff() -> u64 { 50 }
fn default_bind() -> String { "127.0.0.1:9101".into() }
fn default_level() -> String { "info".into() }

impl Storage {
    pub fn chain_path(&self) -> String {
        self.chain_path
            .clone()
            .unwrap_or_else(|| format!("{}/chain", self.path))
    }
}

/// Read the TOML file at `p` and deserialize into `Config`.
/// *Adds context* so user errors print a friendlier message.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read or parsed.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("couldn't read config file {}", p.as_ref().display()))?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<Config> {
    toml::from_str(text)
        .with_context(|| "invalid TOML in config file".to_string())
}
