//! Reconnecting WebSocket transport.
//!
//! A [`SocketDriver`] opens physical links; each link reports its lifecycle as
//! [`SocketEvent`]s on a channel that one pump task drains in order. The
//! transport reacts to those events (open, frames, close, error) and owns the
//! backoff schedule.

use std::sync::Arc;

use async_trait::async_trait;
use dashwire_shared::{
    BinaryFrame, ConnectOutcome, ConnectionMetrics, Message, TransportError, TransportKind,
};
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_channel::oneshot;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;

use super::{Subscriber, Subscription, Transport, TransportCore};
use crate::config::{ReconnectConfig, TransportConfig};
use crate::runtime;

#[cfg(not(target_arch = "wasm32"))]
mod native;
#[cfg(not(target_arch = "wasm32"))]
pub use native::TungsteniteDriver as DefaultSocketDriver;

#[cfg(target_arch = "wasm32")]
mod wasm;
#[cfg(target_arch = "wasm32")]
pub use wasm::BrowserSocketDriver as DefaultSocketDriver;

/// Lifecycle events reported by a link.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Opened,
    Text(String),
    Binary(Vec<u8>),
    Error(String),
    Closed,
}

/// Instructions for a link.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketCommand {
    Send(String),
    Close,
}

/// Opens physical socket links.
pub trait SocketDriver: Send + Sync {
    /// Start opening a link to `url`. Progress is reported on `events`; the
    /// returned sender drives the link. A link must always finish with
    /// [`SocketEvent::Closed`].
    fn open(
        &self,
        url: &str,
        events: UnboundedSender<SocketEvent>,
    ) -> Result<UnboundedSender<SocketCommand>, TransportError>;
}

/// Connection state of a [`SocketTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketPhase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnect budget exhausted; only a manual `connect()` leaves this state.
    Failed,
}

impl SocketPhase {
    pub fn is_connecting(&self) -> bool {
        matches!(self, SocketPhase::Connecting)
    }
}

pub struct SocketTransport {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    core: TransportCore,
    url: String,
    connect_timeout: std::time::Duration,
    reconnect: ReconnectConfig,
    driver: Arc<dyn SocketDriver>,
    link: Mutex<Link>,
}

/// Book-keeping for the current link.
struct Link {
    phase: SocketPhase,
    /// Bumped for every new link; events from older links are ignored.
    generation: u64,
    commands: Option<UnboundedSender<SocketCommand>>,
    pending_connect: Option<oneshot::Sender<Result<(), TransportError>>>,
    /// Reconnect attempts since the last successful open.
    attempts: u32,
    /// Set by `disconnect()`; suppresses reconnection.
    closed_by_user: bool,
}

impl SocketTransport {
    pub fn new(config: &TransportConfig, driver: Arc<dyn SocketDriver>) -> Result<Self, TransportError> {
        let url = config.socket_url()?;
        Ok(Self {
            inner: Arc::new(SocketInner {
                core: TransportCore::new(TransportKind::Socket),
                url,
                connect_timeout: config.connect_timeout,
                reconnect: config.reconnect.clone(),
                driver,
                link: Mutex::new(Link {
                    phase: SocketPhase::Disconnected,
                    generation: 0,
                    commands: None,
                    pending_connect: None,
                    attempts: 0,
                    closed_by_user: false,
                }),
            }),
        })
    }

    /// Socket using the platform driver (tungstenite natively, `WebSocket` in the browser).
    pub fn with_default_driver(config: &TransportConfig) -> Result<Self, TransportError> {
        Self::new(config, Arc::new(DefaultSocketDriver::default()))
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn phase(&self) -> SocketPhase {
        self.inner.link.lock().phase.clone()
    }
}

impl SocketInner {
    /// Open a new link and wait for it to come up.
    ///
    /// `manual` is false for attempts made by the reconnect schedule. When
    /// the link does not open within `connect_timeout` the caller gets
    /// [`TransportError::Timeout`] and the link is told to close; its `Closed`
    /// event then starts the regular backoff schedule like any other drop.
    async fn connect(self: &Arc<Self>, manual: bool) -> Result<ConnectOutcome, TransportError> {
        let (generation, ready) = {
            let mut link = self.link.lock();
            let phase = link.phase.clone();
            match phase {
                SocketPhase::Connected => {
                    return Ok(ConnectOutcome::ok("already connected"));
                }
                SocketPhase::Connecting => {
                    return Ok(ConnectOutcome::ok("connection already in progress"));
                }
                // A manual connect skips the backoff wait; the scheduled
                // attempt sees a newer generation and stands down.
                SocketPhase::Failed | SocketPhase::Disconnected if manual => {
                    link.attempts = 0;
                }
                _ => {}
            }
            if manual {
                link.closed_by_user = false;
            } else if link.closed_by_user {
                return Err(TransportError::NotConnected);
            }

            if let Some(old) = link.commands.take() {
                let _ = old.unbounded_send(SocketCommand::Close);
            }
            link.generation += 1;
            link.phase = SocketPhase::Connecting;

            let (events_tx, events_rx) = unbounded();
            let commands = match self.driver.open(&self.url, events_tx) {
                Ok(commands) => commands,
                Err(e) => {
                    link.phase = SocketPhase::Disconnected;
                    drop(link);
                    self.core.report_error(&e, "socket open");
                    return Err(e);
                }
            };
            link.commands = Some(commands);

            let (ready_tx, ready_rx) = oneshot::channel();
            link.pending_connect = Some(ready_tx);

            let generation = link.generation;
            runtime::spawn(pump(self.clone(), generation, events_rx));
            (generation, ready_rx)
        };

        crate::log_info!("Connecting to {}", self.url);

        match runtime::timeout(self.connect_timeout, ready).await {
            Some(Ok(Ok(()))) => Ok(ConnectOutcome::ok(format!("connected to {}", self.url))),
            Some(Ok(Err(e))) => Err(e),
            Some(Err(_canceled)) => Err(TransportError::channel("connection attempt abandoned")),
            None => {
                let mut link = self.link.lock();
                if link.generation == generation && link.phase.is_connecting() {
                    link.phase = SocketPhase::Disconnected;
                    link.pending_connect = None;
                    if let Some(commands) = &link.commands {
                        // The driver answers with `Closed`, which schedules a retry.
                        let _ = commands.unbounded_send(SocketCommand::Close);
                    }
                }
                crate::log_warn!(
                    "Connection to {} timed out after {:?}",
                    self.url,
                    self.connect_timeout
                );
                Err(TransportError::Timeout(self.connect_timeout))
            }
        }
    }

    fn disconnect(&self) {
        {
            let mut link = self.link.lock();
            link.closed_by_user = true;
            link.generation += 1;
            link.phase = SocketPhase::Disconnected;
            if let Some(commands) = link.commands.take() {
                let _ = commands.unbounded_send(SocketCommand::Close);
            }
            if let Some(waiting) = link.pending_connect.take() {
                let _ = waiting.send(Err(TransportError::NotConnected));
            }
        }
        self.core.set_connected(false);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.link.lock().generation == generation
    }

    fn on_open(&self, generation: u64) {
        let (commands, waiting) = {
            let mut link = self.link.lock();
            if link.generation != generation {
                return;
            }
            link.phase = SocketPhase::Connected;
            link.attempts = 0;
            (link.commands.clone(), link.pending_connect.take())
        };

        crate::log_info!("WebSocket connected to {}", self.url);
        if let Some(commands) = commands {
            self.flush_pending(&commands);
        }
        self.core.set_connected(true);
        if let Some(waiting) = waiting {
            let _ = waiting.send(Ok(()));
        }
    }

    /// Replay buffered writes, one `component_update` per component.
    fn flush_pending(&self, commands: &UnboundedSender<SocketCommand>) {
        let mut queued = self.core.take_pending().into_iter();
        while let Some((id, value)) = queued.next() {
            let sent = Message::component_update(id.clone(), value.clone())
                .to_json()
                .map_err(TransportError::from)
                .and_then(|text| {
                    commands
                        .unbounded_send(SocketCommand::Send(text))
                        .map_err(|_| TransportError::channel("socket closed during replay"))
                });
            match sent {
                Ok(()) => self.core.record_sent(),
                Err(e) => {
                    crate::log_error!("Replaying pending update for {} failed: {}", id, e);
                    let mut unsent = vec![(id, value)];
                    unsent.extend(queued);
                    self.core.restore_pending(unsent);
                    return;
                }
            }
        }
    }

    fn on_text(&self, text: &str) {
        match Message::from_json(text) {
            Ok(message) => self.core.handle_inbound(message),
            Err(e) => {
                self.core.record_received();
                crate::log_error!("Dropping malformed frame: {}", e);
            }
        }
    }

    fn on_binary(&self, bytes: &[u8]) {
        let frame = match BinaryFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.core.record_received();
                crate::log_error!("Dropping undecodable binary frame: {}", e);
                return;
            }
        };
        let kind = frame.kind.clone();
        match frame.into_image_update() {
            Some(message) => self.core.handle_inbound(message),
            None => {
                self.core.record_received();
                crate::log_warn!("Ignoring binary frame of type `{}`", kind);
            }
        }
    }

    fn on_error(&self, generation: u64, reason: String) {
        let waiting = {
            let mut link = self.link.lock();
            if link.generation != generation {
                return;
            }
            link.pending_connect.take()
        };
        let error = TransportError::Channel(reason);
        self.core.report_error(&error, "socket");
        if let Some(waiting) = waiting {
            let _ = waiting.send(Err(error));
        }
    }

    fn on_close(self: &Arc<Self>, generation: u64) {
        let waiting = {
            let mut link = self.link.lock();
            if link.generation != generation {
                return;
            }
            link.phase = SocketPhase::Disconnected;
            link.commands = None;
            link.pending_connect.take()
        };

        crate::log_info!("WebSocket to {} closed", self.url);
        if let Some(waiting) = waiting {
            let _ = waiting.send(Err(TransportError::channel("socket closed before opening")));
        }
        self.core.set_connected(false);
        self.schedule_reconnect(generation);
    }

    fn schedule_reconnect(self: &Arc<Self>, generation: u64) {
        let delay = {
            let mut link = self.link.lock();
            if link.closed_by_user || link.generation != generation {
                return;
            }
            if link.attempts >= self.reconnect.max_attempts {
                link.phase = SocketPhase::Failed;
                None
            } else {
                let delay = self.reconnect.delay_for_attempt(link.attempts);
                link.attempts += 1;
                link.phase = SocketPhase::Reconnecting {
                    attempt: link.attempts,
                };
                Some((delay, link.attempts))
            }
        };

        let Some((delay, attempt)) = delay else {
            let error = TransportError::channel(format!(
                "gave up after {} reconnection attempts",
                self.reconnect.max_attempts
            ));
            self.core.report_error(&error, "reconnect");
            return;
        };

        crate::log_info!(
            "Reconnecting to {} in {}ms (attempt {})",
            self.url,
            delay.as_millis(),
            attempt
        );
        let inner = self.clone();
        runtime::spawn(async move {
            runtime::sleep(delay).await;
            let still_waiting = {
                let link = inner.link.lock();
                link.generation == generation
                    && matches!(link.phase, SocketPhase::Reconnecting { .. })
            };
            if !still_waiting {
                return;
            }
            if let Err(e) = inner.connect(false).await {
                crate::log_warn!("Reconnect attempt {} failed: {}", attempt, e);
            }
        });
    }

    /// Send one update over the open link, or queue it.
    fn send_update(&self, id: &str, value: Value) -> Result<(), TransportError> {
        let commands = {
            let link = self.link.lock();
            match (&link.phase, &link.commands) {
                (SocketPhase::Connected, Some(commands)) => Some(commands.clone()),
                _ => None,
            }
        };
        let Some(commands) = commands else {
            self.core.queue_pending(id, value);
            crate::log_debug!("Queued update for {} until the socket reconnects", id);
            return Err(TransportError::NotConnected);
        };

        let text = Message::component_update(id, value).to_json()?;
        if let Err(e) = commands.unbounded_send(SocketCommand::Send(text)) {
            let error = TransportError::channel(format!("send failed: {}", e.into_send_error()));
            self.core.record_error();
            crate::log_error!("Sending update for {} failed: {}", id, error);
            return Err(error);
        }
        self.core.record_sent();
        Ok(())
    }
}

/// Drain one link's events in delivery order.
async fn pump(inner: Arc<SocketInner>, generation: u64, mut events: UnboundedReceiver<SocketEvent>) {
    while let Some(event) = events.next().await {
        match event {
            SocketEvent::Opened => inner.on_open(generation),
            SocketEvent::Text(text) => {
                if inner.is_current(generation) {
                    inner.on_text(&text);
                }
            }
            SocketEvent::Binary(bytes) => {
                if inner.is_current(generation) {
                    inner.on_binary(&bytes);
                }
            }
            SocketEvent::Error(reason) => inner.on_error(generation, reason),
            SocketEvent::Closed => {
                inner.on_close(generation);
                break;
            }
        }
    }
}

#[async_trait(?Send)]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn connect(&self) -> Result<ConnectOutcome, TransportError> {
        self.inner.connect(true).await
    }

    fn disconnect(&self) {
        self.inner.disconnect();
    }

    fn is_connected(&self) -> bool {
        self.inner.core.is_connected()
    }

    fn get_component_state(&self, id: &str) -> Option<Value> {
        self.inner.core.get_state(id)
    }

    async fn update_component_state(&self, id: &str, value: Value) -> Result<(), TransportError> {
        self.inner.core.set_state(id, value.clone());
        self.inner.send_update(id, value)
    }

    fn subscribe(&self, subscriber: Subscriber) -> Subscription {
        self.inner.core.subscribe(subscriber)
    }

    fn connection_metrics(&self) -> ConnectionMetrics {
        self.inner.core.metrics()
    }
}

#[cfg(test)]
mod tests;
