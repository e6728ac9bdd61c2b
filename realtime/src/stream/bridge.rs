use crate::bus::EventBus;
use crate::dispatch::{Handler, HandlerError};
use crate::event::{Event, channels};
use crate::stream::update::StreamUpdate;
use async_trait::async_trait;
use std::sync::Arc;

/// Stream callback that republishes price ticks on an event bus
///
/// Other updates are ignored.
pub struct BusBridge {
    bus: Arc<EventBus>,
    channel: String,
}

impl BusBridge {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_channel(bus, channels::PRICE_UPDATES)
    }

    pub fn with_channel(bus: Arc<EventBus>, channel: impl Into<String>) -> Self {
        Self {
            bus,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl Handler<StreamUpdate> for BusBridge {
    async fn handle(&self, update: &StreamUpdate) -> Result<(), HandlerError> {
        let Some(tick) = update.as_price() else {
            return Ok(());
        };

        let mut event = Event::price_tick(
            &tick.ticker,
            tick.price,
            tick.change,
            tick.change_percent,
            tick.volume,
            self.bus.source(),
        )
        .with_channel(self.channel.as_str());
        if let Some(timestamp) = tick.timestamp {
            event = event.with_timestamp(timestamp);
        }

        self.bus.publish(&event)?;
        Ok(())
    }
}
