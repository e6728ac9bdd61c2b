//! market-relay - Real-time distribution for a market data service
//!
//! - [`EventBus`]: channel-addressed publish/subscribe with isolated,
//!   ordered handler dispatch over a pluggable [`Transport`]
//! - [`StreamingClient`]: a WebSocket feed client that keeps its
//!   subscriptions across reconnects and fans updates out to callbacks
//! - [`BusBridge`]: republishes streamed price ticks onto the bus
//!
//! ```rust,no_run
//! use market_relay::{BusBridge, EventBus, RelayConfig, StreamingClient};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), market_relay::StreamError> {
//! let config = RelayConfig::default();
//! let bus = Arc::new(EventBus::new(config.bus.clone()));
//! let client = StreamingClient::new(config.stream.clone());
//!
//! client.subscribe("005930");
//! client.register_callback(Arc::new(BusBridge::new(bus.clone())));
//! client.connect().await?;
//! client.listen().await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod stream;
pub mod transport;

pub use bus::{BusStats, EventBus};
pub use config::{BusConfig, RelayConfig, StreamingConfig, load_config, load_config_from_str};
pub use dispatch::{DispatchOutcome, FnHandler, Handler, HandlerError, dispatch_all, handler_fn};
pub use error::{BusError, ConfigError, StreamError};
pub use event::{Event, channels};
pub use stream::{
    BusBridge, ControlAck, ControlAction, ControlMessage, PriceTick, StreamUpdate, StreamingClient,
};
pub use transport::{LocalTransport, Transport, TransportMessage, TransportReceiver};
