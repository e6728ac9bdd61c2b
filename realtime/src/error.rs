use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Transport closed")]
    TransportClosed,
    #[error("Event bus is already listening")]
    AlreadyListening,
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Connection error: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Failed to decode update: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Not connected")]
    NotConnected,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Stream listener is already running")]
    AlreadyListening,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}
