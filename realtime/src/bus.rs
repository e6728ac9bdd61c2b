//! Channel-addressed publish/subscribe
//!
//! Publishing encodes the event and hands it to the transport without waiting
//! for handlers. Handlers run in the bus's single receive loop
//! ([`EventBus::listen`]), sequentially per message, in subscription order.
//! Delivery is at-most-once: events on a channel nobody listens to are
//! dropped.

use crate::config::BusConfig;
use crate::dispatch::{Handler, HandlerError, dispatch_all, handler_fn};
use crate::error::BusError;
use crate::event::Event;
use crate::transport::{LocalTransport, Transport, TransportMessage, TransportReceiver};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub handler_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    handler_failures: AtomicU64,
}

pub struct EventBus {
    config: BusConfig,
    transport: Arc<dyn Transport>,
    handlers: RwLock<HashMap<String, Vec<Arc<dyn Handler<Event>>>>>,
    stop: watch::Sender<bool>,
    listening: Arc<AtomicBool>,
    counters: Counters,
}

impl EventBus {
    /// Bus over its own in-process transport
    pub fn new(config: BusConfig) -> Self {
        let transport = Arc::new(LocalTransport::new(config.capacity));
        Self::with_transport(config, transport)
    }

    /// Bus over a shared transport, so events cross between bus instances
    pub fn with_transport(config: BusConfig, transport: Arc<dyn Transport>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            config,
            transport,
            handlers: RwLock::new(HashMap::new()),
            stop,
            listening: Arc::new(AtomicBool::new(false)),
            counters: Counters::default(),
        }
    }

    pub fn source(&self) -> &str {
        &self.config.source
    }

    /// Register `handler` for `channel`; effective for messages received from now on
    pub fn subscribe(&self, channel: impl Into<String>, handler: Arc<dyn Handler<Event>>) {
        let channel = channel.into();
        debug!(channel = %channel, "handler subscribed");
        self.handlers.write().entry(channel).or_default().push(handler);
    }

    pub fn subscribe_fn<F>(&self, channel: impl Into<String>, f: F)
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(channel, handler_fn(f));
    }

    /// Send `event` on its channel; returns the number of listening buses reached
    pub fn publish(&self, event: &Event) -> Result<usize, BusError> {
        let payload = event.to_json()?;
        let receivers = self.transport.publish(event.channel(), payload)?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        debug!(
            channel = event.channel(),
            event_type = event.event_type(),
            receivers,
            "event published"
        );
        Ok(receivers)
    }

    /// Build an event stamped with this bus's source and publish it
    pub fn emit(
        &self,
        channel: &str,
        event_type: &str,
        data: Map<String, Value>,
    ) -> Result<usize, BusError> {
        self.publish(&Event::new(channel, event_type, data, self.config.source.clone()))
    }

    /// Run the receive loop until [`stop_listening`](Self::stop_listening)
    ///
    /// Fails with [`BusError::AlreadyListening`] while another loop runs on
    /// this bus.
    pub async fn listen(&self) -> Result<(), BusError> {
        let _guard = ListenGuard::acquire(&self.listening).ok_or(BusError::AlreadyListening)?;
        let receiver = self.transport.subscribe();
        self.stop.send_replace(false);
        self.run(receiver).await;
        Ok(())
    }

    /// Start the receive loop on a task
    ///
    /// The loop is attached to the transport before this returns, so events
    /// published right afterwards are not missed.
    pub fn spawn_listener(self: &Arc<Self>) -> Result<JoinHandle<()>, BusError> {
        let guard = ListenGuard::acquire(&self.listening).ok_or(BusError::AlreadyListening)?;
        let receiver = self.transport.subscribe();
        self.stop.send_replace(false);
        let bus = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let _guard = guard;
            bus.run(receiver).await
        }))
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Drop every subscription and end the receive loop
    ///
    /// A message already being dispatched finishes first.
    pub fn stop_listening(&self) {
        self.handlers.write().clear();
        self.stop.send_replace(true);
        info!(source = %self.config.source, "event bus stopping");
    }

    /// Channels with at least one handler, sorted
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .handlers
            .read()
            .iter()
            .filter(|(_, handlers)| !handlers.is_empty())
            .map(|(channel, _)| channel.clone())
            .collect();
        channels.sort();
        channels
    }

    pub fn handler_count(&self, channel: &str) -> usize {
        self.handlers.read().get(channel).map_or(0, Vec::len)
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
        }
    }

    async fn run(&self, mut receiver: Box<dyn TransportReceiver>) {
        let mut stop = self.stop.subscribe();
        info!(source = %self.config.source, "event bus listening");

        loop {
            let message = tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                message = receiver.recv() => match message {
                    Some(message) => message,
                    None => {
                        warn!("event bus transport closed");
                        break;
                    }
                },
            };
            self.dispatch(message).await;
        }

        info!(source = %self.config.source, "event bus stopped listening");
    }

    async fn dispatch(&self, message: TransportMessage) {
        let handlers = self
            .handlers
            .read()
            .get(&message.channel)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            return;
        }

        let event = match Event::from_json(&message.channel, &message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(channel = %message.channel, error = %e, "undecodable event dropped");
                return;
            }
        };

        let outcome = dispatch_all(&handlers, &event, &message.channel).await;
        self.counters
            .delivered
            .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        self.counters
            .handler_failures
            .fetch_add(outcome.failed as u64, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.config)
            .field("channels", &self.channels())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Claim on a receive loop; released when the loop ends or its task is dropped
pub(crate) struct ListenGuard(Arc<AtomicBool>);

impl ListenGuard {
    pub(crate) fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for ListenGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Resolves once the stop flag is raised (or its sender is gone)
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}
