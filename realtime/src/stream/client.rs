//! Reconnecting WebSocket client for the market data feed
//!
//! The client owns the desired subscription set. It survives any number of
//! physical connections: each successful connect replays the set as it is at
//! that moment, in the order topics were first subscribed.

use crate::bus::{ListenGuard, stopped};
use crate::config::StreamingConfig;
use crate::dispatch::{Handler, HandlerError, dispatch_all, handler_fn};
use crate::error::StreamError;
use crate::stream::update::{ControlMessage, StreamUpdate};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use indexmap::IndexSet;
use market_guard::clock::jittered;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// State shared between the control methods and the live connection
struct Link {
    subscriptions: IndexSet<String>,
    /// Feeds the writer task of the current connection
    outbound: Option<mpsc::UnboundedSender<Message>>,
}

/// Result of waiting for the next frame in the listen loop
enum Read {
    Frame(String),
    Closed(String),
    Stopped,
}

pub struct StreamingClient {
    config: StreamingConfig,
    link: Mutex<Link>,
    reader: tokio::sync::Mutex<Option<SplitStream<WsStream>>>,
    callbacks: RwLock<Vec<Arc<dyn Handler<StreamUpdate>>>>,
    stop: watch::Sender<bool>,
    listening: Arc<AtomicBool>,
    connected: AtomicBool,
}

impl StreamingClient {
    pub fn new(config: StreamingConfig) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            config,
            link: Mutex::new(Link {
                subscriptions: IndexSet::new(),
                outbound: None,
            }),
            reader: tokio::sync::Mutex::new(None),
            callbacks: RwLock::new(Vec::new()),
            stop,
            listening: Arc::new(AtomicBool::new(false)),
            connected: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Desired topics in subscription order
    pub fn subscriptions(&self) -> Vec<String> {
        self.link.lock().subscriptions.iter().cloned().collect()
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Open the connection and replay every subscription
    pub async fn connect(&self) -> Result<(), StreamError> {
        self.stop.send_replace(false);
        self.open().await
    }

    /// Add `topic`; sent right away when connected, otherwise on the next connect
    ///
    /// Returns false if the topic was already subscribed.
    pub fn subscribe(&self, topic: impl Into<String>) -> bool {
        let topic = topic.into();
        let mut link = self.link.lock();
        if !link.subscriptions.insert(topic.clone()) {
            return false;
        }
        if let Some(outbound) = &link.outbound {
            send_control(outbound, &ControlMessage::subscribe(topic));
        }
        true
    }

    /// Remove `topic`; returns false if it was not subscribed
    pub fn unsubscribe(&self, topic: &str) -> bool {
        let mut link = self.link.lock();
        if !link.subscriptions.shift_remove(topic) {
            return false;
        }
        if let Some(outbound) = &link.outbound {
            send_control(outbound, &ControlMessage::unsubscribe(topic));
        }
        true
    }

    /// Every registered callback receives every update
    pub fn register_callback(&self, callback: Arc<dyn Handler<StreamUpdate>>) {
        self.callbacks.write().push(callback);
    }

    pub fn on_update<F>(&self, f: F)
    where
        F: Fn(&StreamUpdate) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register_callback(handler_fn(f));
    }

    /// Receive and dispatch updates until [`disconnect`](Self::disconnect)
    ///
    /// Connects first if needed. A lost connection is dropped and retried
    /// after `reconnect_interval`, forever; the subscription set is left
    /// untouched so the next connect restores it in full.
    ///
    /// Clears a previous [`disconnect`](Self::disconnect). Fails with
    /// [`StreamError::AlreadyListening`] while another loop runs on this client.
    pub async fn listen(&self) -> Result<(), StreamError> {
        let _guard = ListenGuard::acquire(&self.listening).ok_or(StreamError::AlreadyListening)?;
        self.stop.send_replace(false);
        let mut stop = self.stop.subscribe();

        loop {
            if *stop.borrow() {
                break;
            }

            if !self.is_connected() {
                let opened = tokio::select! {
                    biased;
                    _ = stopped(&mut stop) => break,
                    opened = self.open() => opened,
                };
                if let Err(e) = opened {
                    warn!(uri = %self.config.uri, error = %e, "stream connect failed");
                    if self.backoff(&mut stop).await {
                        break;
                    }
                    continue;
                }
            }

            match self.read_next(&mut stop).await {
                Read::Frame(text) => self.deliver(&text).await,
                Read::Stopped => break,
                Read::Closed(reason) => {
                    warn!(uri = %self.config.uri, reason = %reason, "stream connection lost");
                    self.drop_connection().await;
                    if self.backoff(&mut stop).await {
                        break;
                    }
                }
            }
        }

        self.drop_connection().await;
        info!(uri = %self.config.uri, "stream listener stopped");
        Ok(())
    }

    /// Wait up to `timeout` for a single update without dispatching it
    ///
    /// While [`listen`](Self::listen) owns the connection this returns
    /// `Ok(None)` once the timeout passes.
    pub async fn listen_once(&self, timeout: Duration) -> Result<Option<StreamUpdate>, StreamError> {
        let deadline = Instant::now() + timeout;
        let Ok(mut reader) = tokio::time::timeout_at(deadline, self.reader.lock()).await else {
            return Ok(None);
        };
        let stream = reader.as_mut().ok_or(StreamError::NotConnected)?;

        loop {
            let frame = match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(frame) => frame,
                Err(_) => return Ok(None),
            };

            let failure = match frame {
                Some(Ok(message)) => match frame_text(message) {
                    Frame::Text(text) => return Ok(Some(StreamUpdate::decode(&text)?)),
                    Frame::Skip => continue,
                    Frame::Close(_) => StreamError::ConnectionClosed,
                },
                Some(Err(e)) => StreamError::Connection(e),
                None => StreamError::ConnectionClosed,
            };

            *reader = None;
            self.connected.store(false, Ordering::Release);
            self.link.lock().outbound = None;
            return Err(failure);
        }
    }

    /// Stop the listen loop, cancel a pending reconnect wait and close the socket
    pub fn disconnect(&self) {
        self.stop.send_replace(true);
        self.connected.store(false, Ordering::Release);
        // Dropping the sender makes the writer send a close frame and exit.
        self.link.lock().outbound = None;
        if let Ok(mut reader) = self.reader.try_lock() {
            *reader = None;
        }
        info!(uri = %self.config.uri, "stream disconnected");
    }

    async fn open(&self) -> Result<(), StreamError> {
        let (socket, _) = connect_async(self.config.uri.as_str()).await?;
        let (sink, stream) = socket.split();
        let (outbound, queue) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(sink, queue, self.config.ping_interval));

        *self.reader.lock().await = Some(stream);

        let replayed = {
            let mut link = self.link.lock();
            for topic in &link.subscriptions {
                send_control(&outbound, &ControlMessage::subscribe(topic.as_str()));
            }
            link.outbound = Some(outbound);
            link.subscriptions.len()
        };
        self.connected.store(true, Ordering::Release);

        info!(uri = %self.config.uri, resubscribed = replayed, "stream connected");
        Ok(())
    }

    async fn read_next(&self, stop: &mut watch::Receiver<bool>) -> Read {
        let mut reader = self.reader.lock().await;
        let Some(stream) = reader.as_mut() else {
            return Read::Closed("no live connection".to_string());
        };

        loop {
            let frame = tokio::select! {
                biased;
                _ = stopped(stop) => return Read::Stopped,
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(message)) => match frame_text(message) {
                    Frame::Text(text) => return Read::Frame(text),
                    Frame::Skip => continue,
                    Frame::Close(reason) => return Read::Closed(reason),
                },
                Some(Err(e)) => return Read::Closed(e.to_string()),
                None => return Read::Closed("stream ended".to_string()),
            }
        }
    }

    async fn deliver(&self, text: &str) {
        let update = match StreamUpdate::decode(text) {
            Ok(update) => update,
            Err(e) => {
                warn!(error = %e, "undecodable stream frame dropped");
                return;
            }
        };

        let callbacks = self.callbacks.read().clone();
        dispatch_all(&callbacks, &update, "stream").await;
    }

    async fn drop_connection(&self) {
        self.connected.store(false, Ordering::Release);
        self.link.lock().outbound = None;
        *self.reader.lock().await = None;
    }

    /// Sleep before reconnecting; true if stopped while waiting
    async fn backoff(&self, stop: &mut watch::Receiver<bool>) -> bool {
        let delay = jittered(self.config.reconnect_interval, self.config.reconnect_jitter);
        debug!(delay_ms = delay.as_millis() as u64, "waiting before reconnect");

        tokio::select! {
            biased;
            _ = stopped(stop) => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}

impl std::fmt::Debug for StreamingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingClient")
            .field("uri", &self.config.uri)
            .field("connected", &self.is_connected())
            .field("subscriptions", &self.subscriptions())
            .finish_non_exhaustive()
    }
}

enum Frame {
    Text(String),
    Close(String),
    Skip,
}

fn frame_text(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text.as_str().to_owned()),
        Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Frame::Text(text),
            Err(_) => {
                warn!(len = bytes.len(), "non-utf8 binary frame ignored");
                Frame::Skip
            }
        },
        Message::Ping(_) | Message::Pong(_) => {
            trace!("keep-alive frame");
            Frame::Skip
        }
        Message::Close(frame) => Frame::Close(match frame {
            Some(frame) => format!("closed by peer: {} {}", u16::from(frame.code), frame.reason.as_str()),
            None => "closed by peer".to_string(),
        }),
        Message::Frame(_) => Frame::Skip,
    }
}

fn send_control(outbound: &mpsc::UnboundedSender<Message>, control: &ControlMessage) {
    match control.to_json() {
        Ok(json) => {
            // A closed queue means the connection is going away; the next
            // connect replays the subscription set anyway.
            let _ = outbound.send(Message::Text(json.into()));
        }
        Err(e) => warn!(topic = %control.topic, error = %e, "control message not encoded"),
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut queue: mpsc::UnboundedReceiver<Message>,
    ping_interval: Duration,
) {
    let mut ping = (!ping_interval.is_zero()).then(|| {
        let mut interval = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        let next = tokio::select! {
            message = queue.recv() => message,
            _ = async {
                match ping.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {
                trace!("sending keep-alive ping");
                Some(Message::Ping(Default::default()))
            }
        };

        match next {
            Some(message) => {
                if let Err(e) = sink.send(message).await {
                    debug!(error = %e, "stream write failed");
                    break;
                }
            }
            None => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}
