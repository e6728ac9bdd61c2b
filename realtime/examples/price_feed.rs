//! Relay a WebSocket price feed onto the in-process event bus
//!
//! ```sh
//! RELAY_CONFIG=relay.json RUST_LOG=market_relay=debug cargo run --example price_feed -- 005930 000660
//! ```
//!
//! Without `RELAY_CONFIG` the defaults connect to `ws://127.0.0.1:8765/stream`
//! and keep retrying until a feed comes up. Ctrl-C stops the relay.

use market_relay::{
    BusBridge, Event, EventBus, RelayConfig, StreamingClient, channels, load_config,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "market_relay=info,market_guard=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::var("RELAY_CONFIG") {
        Ok(path) => match load_config(&path) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %path, error = %e, "failed to load relay config");
                return;
            }
        },
        Err(_) => RelayConfig::default(),
    };

    let bus = Arc::new(EventBus::new(config.bus.clone()));
    bus.subscribe_fn(channels::PRICE_UPDATES, |event: &Event| {
        info!(
            ticker = ?event.get("ticker"),
            price = ?event.get("price"),
            change_percent = ?event.get("change_percent"),
            "tick"
        );
        Ok(())
    });
    let bus_listener = match bus.spawn_listener() {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "failed to start event bus");
            return;
        }
    };

    let client = Arc::new(StreamingClient::new(config.stream.clone()));
    client.register_callback(Arc::new(BusBridge::new(Arc::clone(&bus))));

    let mut topics: Vec<String> = std::env::args().skip(1).collect();
    if topics.is_empty() {
        topics.push("005930".to_string());
    }
    for topic in topics {
        client.subscribe(topic);
    }

    let stream_listener = tokio::spawn({
        let client = Arc::clone(&client);
        async move {
            if let Err(e) = client.listen().await {
                error!(error = %e, "stream listener failed");
            }
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to wait for ctrl-c");
    }

    client.disconnect();
    bus.stop_listening();
    let _ = stream_listener.await;
    let _ = bus_listener.await;

    let stats = bus.stats();
    info!(
        published = stats.published,
        delivered = stats.delivered,
        handler_failures = stats.handler_failures,
        "relay stopped"
    );
}
