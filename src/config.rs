use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::hash::HashAlgorithm;
use crate::{ClientError, Result};

/// Configuration for a [`RingClient`](crate::RingClient), its connection pool and its routing
/// refresh loop.
///
/// Every field has a default, so a JSON document only needs to name the fields it changes:
/// ```json
/// { "hash_name": "roma", "read_timeout_ms": 2000, "batch_threads": 8 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// the hash-name appended to every key on the wire
    pub hash_name: String,
    /// the name of the key hash strategy, see [`HashAlgorithm`]
    pub hash_algorithm: String,
    /// maximum number of idle connections kept per node
    pub max_idle_per_node: usize,
    /// transport connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// read timeout in milliseconds, `0` disables it
    pub read_timeout_ms: u64,
    /// write timeout in milliseconds, `0` disables it
    pub write_timeout_ms: u64,
    /// period of the routing table refresh loop in milliseconds
    pub refresh_interval_ms: u64,
    /// number of worker threads used by concurrent batch retrieval
    pub batch_threads: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            hash_name: "roma".to_string(),
            hash_algorithm: "sha1".to_string(),
            max_idle_per_node: 8,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            refresh_interval_ms: 3_000,
            batch_threads: 4,
        }
    }
}

impl ClientConfig {
    /// parses a configuration from a JSON string, then validates it
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ClientConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// reads and parses a JSON configuration file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("could not read {:?}: {}", path, e)))?;
        Self::from_json_str(&json)
    }

    /// checks that the configuration can be used to build a client
    pub fn validate(&self) -> Result<()> {
        if self.hash_name.is_empty() || self.hash_name.chars().any(|c| c.is_whitespace()) {
            return Err(ClientError::Config(format!("invalid hash_name {:?}", self.hash_name)));
        }
        if self.batch_threads == 0 {
            return Err(ClientError::Config("batch_threads must be at least 1".into()));
        }
        if self.refresh_interval_ms == 0 {
            return Err(ClientError::Config("refresh_interval_ms must be positive".into()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ClientError::Config("connect_timeout_ms must be positive".into()));
        }
        self.hash_algorithm()?;
        Ok(())
    }

    /// the configured key hash strategy
    pub fn hash_algorithm(&self) -> Result<HashAlgorithm> {
        self.hash_algorithm.parse()
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub(crate) fn read_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.read_timeout_ms)
    }

    pub(crate) fn write_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.write_timeout_ms)
    }

    pub(crate) fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}
