//! Domain events and their wire form
//!
//! On the wire an event is one JSON object,
//! `{"event_type": ..., "data": {...}, "timestamp": "<ISO-8601>", "source": ...}`.
//! The channel is the transport's routing key and is not part of the payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Channels used between services
pub mod channels {
    pub const SIGNALS: &str = "signals";
    pub const MARKET_STATUS: &str = "market:status";
    pub const PRICE_UPDATES: &str = "price:updates";
    pub const ALERTS: &str = "alerts";
}

/// An immutable domain event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(skip)]
    channel: String,
    event_type: String,
    #[serde(default)]
    data: Map<String, Value>,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    source: String,
}

impl Event {
    pub fn new(
        channel: impl Into<String>,
        event_type: impl Into<String>,
        data: Map<String, Value>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
            source: source.into(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Route the event to a different channel
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// A new trading signal was produced by the scoring service
    pub fn signal_created(
        ticker: &str,
        signal_type: &str,
        score: f64,
        source: impl Into<String>,
    ) -> Self {
        let mut data = Map::new();
        data.insert("ticker".into(), ticker.into());
        data.insert("signal_type".into(), signal_type.into());
        data.insert("score".into(), score.into());
        Self::new(channels::SIGNALS, "signal_created", data, source)
    }

    /// Market session changed (e.g. "pre_open", "open", "closed")
    pub fn market_status(status: &str, source: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("status".into(), status.into());
        Self::new(channels::MARKET_STATUS, "market_status_changed", data, source)
    }

    pub fn price_tick(
        ticker: &str,
        price: f64,
        change: f64,
        change_percent: f64,
        volume: f64,
        source: impl Into<String>,
    ) -> Self {
        let mut data = Map::new();
        data.insert("ticker".into(), ticker.into());
        data.insert("price".into(), price.into());
        data.insert("change".into(), change.into());
        data.insert("change_percent".into(), change_percent.into());
        data.insert("volume".into(), volume.into());
        Self::new(channels::PRICE_UPDATES, "price_tick", data, source)
    }

    pub fn alert(level: &str, message: &str, source: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("level".into(), level.into());
        data.insert("message".into(), message.into());
        Self::new(channels::ALERTS, "alert", data, source)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a payload received on `channel`
    pub fn from_json(channel: &str, payload: &str) -> Result<Self, serde_json::Error> {
        let mut event: Event = serde_json::from_str(payload)?;
        event.channel = channel.to_string();
        Ok(event)
    }
}
