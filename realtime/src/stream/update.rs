//! Frames exchanged with the market data feed

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Subscribe,
    Unsubscribe,
}

/// Outbound `{"action": "subscribe" | "unsubscribe", "topic": ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub action: ControlAction,
    pub topic: String,
}

impl ControlMessage {
    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self {
            action: ControlAction::Subscribe,
            topic: topic.into(),
        }
    }

    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        Self {
            action: ControlAction::Unsubscribe,
            topic: topic.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub ticker: String,
    pub price: f64,
    #[serde(default)]
    pub change: f64,
    #[serde(default)]
    pub change_percent: f64,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Server acknowledgement of a control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlAck {
    pub action: ControlAction,
    pub topic: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// An inbound frame, decoded by shape rather than by topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamUpdate {
    Price(PriceTick),
    Ack(ControlAck),
    Other(Value),
}

impl StreamUpdate {
    /// Decode a text frame; fails only on invalid JSON
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Topic the update belongs to, when it names one
    pub fn topic(&self) -> Option<&str> {
        match self {
            StreamUpdate::Price(tick) => Some(&tick.ticker),
            StreamUpdate::Ack(ack) => Some(&ack.topic),
            StreamUpdate::Other(value) => value
                .get("topic")
                .or_else(|| value.get("ticker"))
                .and_then(Value::as_str),
        }
    }

    pub fn as_price(&self) -> Option<&PriceTick> {
        match self {
            StreamUpdate::Price(tick) => Some(tick),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_message_wire_form() {
        assert_eq!(
            ControlMessage::subscribe("005930").to_json().unwrap(),
            r#"{"action":"subscribe","topic":"005930"}"#
        );
        assert_eq!(
            ControlMessage::unsubscribe("005930").to_json().unwrap(),
            r#"{"action":"unsubscribe","topic":"005930"}"#
        );
    }

    #[test]
    fn test_decodes_price_tick_with_partial_fields() {
        let update = StreamUpdate::decode(
            r#"{"ticker":"005930","price":71200,"volume":1520033,"timestamp":"2025-03-14T00:00:01Z"}"#,
        )
        .unwrap();

        let tick = update.as_price().expect("price tick");
        assert_eq!(tick.price, 71200.0);
        assert_eq!(tick.change, 0.0);
        assert_eq!(tick.volume, 1520033.0);
        assert!(tick.timestamp.is_some());
        assert_eq!(update.topic(), Some("005930"));
    }

    #[test]
    fn test_decodes_acks_and_unknown_frames() {
        let ack = StreamUpdate::decode(r#"{"action":"subscribe","topic":"A","status":"ok"}"#).unwrap();
        assert!(matches!(ack, StreamUpdate::Ack(ref a) if a.status.as_deref() == Some("ok")));
        assert_eq!(ack.topic(), Some("A"));

        // A tick whose timestamp is not RFC 3339 is still delivered, untyped.
        let raw = StreamUpdate::decode(r#"{"ticker":"A","price":1.0,"timestamp":"09:00:01"}"#).unwrap();
        assert!(matches!(raw, StreamUpdate::Other(_)));
        assert_eq!(raw.topic(), Some("A"));

        let heartbeat = StreamUpdate::decode(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(heartbeat.topic(), None);

        assert!(StreamUpdate::decode("{oops").is_err());
    }
}
