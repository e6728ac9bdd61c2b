//! Relay configuration
//!
//! Durations are written in milliseconds (`*_ms` keys).

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub uri: String,
    /// Wait between a lost connection and the next connect attempt
    #[serde(rename = "reconnect_interval_ms", with = "millis")]
    pub reconnect_interval: Duration,
    /// Keep-alive ping period; zero disables pings
    #[serde(rename = "ping_interval_ms", with = "millis")]
    pub ping_interval: Duration,
    /// Jitter factor applied to the reconnect wait (0.0 = fixed interval)
    pub reconnect_jitter: f64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            uri: "ws://127.0.0.1:8765/stream".to_string(),
            reconnect_interval: Duration::from_secs(5),
            ping_interval: Duration::from_secs(20),
            reconnect_jitter: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Stamped into the `source` field of events this process emits
    pub source: String,
    /// Messages buffered per listener before it starts skipping
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            source: "market-relay".to_string(),
            capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub stream: StreamingConfig,
    pub bus: BusConfig,
}

/// Load relay configuration from a JSON file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RelayConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_str(&content)
}

/// Load relay configuration from a JSON string
pub fn load_config_from_str(json: &str) -> Result<RelayConfig, ConfigError> {
    Ok(serde_json::from_str(json)?)
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
