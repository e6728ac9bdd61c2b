//! Market data stream: WebSocket client, frame types and the bus bridge

pub mod bridge;
pub mod client;
pub mod update;

pub use bridge::BusBridge;
pub use client::StreamingClient;
pub use update::{ControlAck, ControlAction, ControlMessage, PriceTick, StreamUpdate};
