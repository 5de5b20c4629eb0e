use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default TCP connect timeout towards a remote endpoint, in seconds.
pub const TCP_CONNECT_TIMEOUT_SECS: f64 = 3.0;
/// Default TLS/handshake timeout towards a remote endpoint, in seconds.
pub const TLS_HANDSHAKE_TIMEOUT_SECS: f64 = 3.0;
/// Default number of extra connection attempts. Zero fails early when a
/// host is down.
pub const CONNECT_RETRY_DEFAULT: u32 = 0;
/// Default niceness applied to the local decode process.
pub const DECODER_NICE_DEFAULT: i32 = 3;

/// Configuration for one remote-capable worker.
///
/// Immutable after pool construction.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Identity, unique within the pool
    pub id: String,
    /// Remote transcription endpoint (ws:// or wss:// URL)
    pub url: String,
    /// TCP connect timeout
    pub tcp_connect_timeout: Duration,
    /// TLS/websocket handshake timeout
    pub tls_handshake_timeout: Duration,
    /// Extra connection attempts before the endpoint is declared unavailable
    pub connect_retry: u32,
    /// Niceness for the local decode process; 0 disables renicing
    pub decoder_nice: Option<i32>,
}

impl WorkerConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            tcp_connect_timeout: Duration::from_secs_f64(TCP_CONNECT_TIMEOUT_SECS),
            tls_handshake_timeout: Duration::from_secs_f64(TLS_HANDSHAKE_TIMEOUT_SECS),
            connect_retry: CONNECT_RETRY_DEFAULT,
            decoder_nice: None,
        }
    }
}

/// One `[[workers]]` entry of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerEntry {
    pub id: String,
    pub url: String,
    #[serde(default = "default_tcp_timeout")]
    pub tcp_connect_timeout_secs: f64,
    #[serde(default = "default_tls_timeout")]
    pub tls_handshake_timeout_secs: f64,
    #[serde(default = "default_connect_retry")]
    pub connect_retry: u32,
    #[serde(default)]
    pub decoder_nice: Option<i32>,
}

fn default_tcp_timeout() -> f64 {
    TCP_CONNECT_TIMEOUT_SECS
}

fn default_tls_timeout() -> f64 {
    TLS_HANDSHAKE_TIMEOUT_SECS
}

fn default_connect_retry() -> u32 {
    CONNECT_RETRY_DEFAULT
}

impl From<WorkerEntry> for WorkerConfig {
    fn from(entry: WorkerEntry) -> Self {
        Self {
            id: entry.id,
            url: entry.url,
            tcp_connect_timeout: Duration::from_secs_f64(entry.tcp_connect_timeout_secs),
            tls_handshake_timeout: Duration::from_secs_f64(entry.tls_handshake_timeout_secs),
            connect_retry: entry.connect_retry,
            decoder_nice: entry.decoder_nice,
        }
    }
}

/// Worker endpoint configuration file (TOML).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkersFile {
    #[serde(default)]
    pub workers: Vec<WorkerEntry>,
}

impl WorkersFile {
    /// Load worker configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read worker config {:?}", path.as_ref()))?;
        let file: WorkersFile =
            toml::from_str(&content).with_context(|| "Failed to parse worker config")?;
        Ok(file)
    }

    pub fn into_worker_configs(self) -> Vec<WorkerConfig> {
        self.workers.into_iter().map(WorkerConfig::from).collect()
    }
}
