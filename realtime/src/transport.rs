//! Message transport under the event bus
//!
//! A transport moves already-encoded payloads between publishers and
//! subscribers, keyed by channel. [`LocalTransport`] connects every bus that
//! shares it inside one process; a networked broker would implement the same
//! pair of traits.

use crate::error::BusError;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub channel: String,
    pub payload: String,
}

pub trait Transport: Send + Sync {
    /// Send `payload` on `channel`; returns how many subscribers received it
    fn publish(&self, channel: &str, payload: String) -> Result<usize, BusError>;

    /// Start receiving every message published from now on
    fn subscribe(&self) -> Box<dyn TransportReceiver>;
}

#[async_trait]
pub trait TransportReceiver: Send {
    /// Next message, or `None` once the transport is gone
    async fn recv(&mut self) -> Option<TransportMessage>;
}

/// In-process transport over a tokio broadcast channel
///
/// Messages published while nobody subscribes are dropped. A receiver that
/// falls more than `capacity` messages behind skips the oldest ones.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    sender: broadcast::Sender<TransportMessage>,
}

impl LocalTransport {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Transport for LocalTransport {
    fn publish(&self, channel: &str, payload: String) -> Result<usize, BusError> {
        let message = TransportMessage {
            channel: channel.to_string(),
            payload,
        };
        // A send error only means there are no receivers right now.
        Ok(self.sender.send(message).unwrap_or(0))
    }

    fn subscribe(&self) -> Box<dyn TransportReceiver> {
        Box::new(LocalReceiver {
            inner: self.sender.subscribe(),
        })
    }
}

struct LocalReceiver {
    inner: broadcast::Receiver<TransportMessage>,
}

#[async_trait]
impl TransportReceiver for LocalReceiver {
    async fn recv(&mut self) -> Option<TransportMessage> {
        loop {
            match self.inner.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "transport receiver lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_receivers_is_dropped() {
        let transport = LocalTransport::new(8);

        assert_eq!(transport.publish("signals", "{}".into()).unwrap(), 0);

        let mut receiver = transport.subscribe();
        assert_eq!(transport.publish("alerts", "{\"n\":1}".into()).unwrap(), 1);

        let message = receiver.recv().await.unwrap();
        assert_eq!(message.channel, "alerts");
        assert_eq!(message.payload, "{\"n\":1}");
    }

    #[tokio::test]
    async fn test_lagging_receiver_skips_to_retained_messages() {
        let transport = LocalTransport::new(2);
        let mut receiver = transport.subscribe();

        for n in 0..5 {
            transport.publish("price:updates", n.to_string()).unwrap();
        }

        assert_eq!(receiver.recv().await.unwrap().payload, "3");
        assert_eq!(receiver.recv().await.unwrap().payload, "4");
    }
}
