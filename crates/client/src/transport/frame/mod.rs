//! Transport for dashboards embedded in a parent page.
//!
//! Messages travel as JSON text through a [`FrameChannel`]. There is no link
//! to lose, so no backoff: connecting just starts listening.

use std::sync::Arc;

use async_trait::async_trait;
use dashwire_shared::{ConnectOutcome, ConnectionMetrics, Message, TransportError, TransportKind};
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::StreamExt;
use serde_json::Value;

use super::{Subscriber, Subscription, Transport, TransportCore};
use crate::runtime;

#[cfg(target_arch = "wasm32")]
mod wasm;
#[cfg(target_arch = "wasm32")]
pub use wasm::ParentFrame;

/// Message port to the embedding page.
pub trait FrameChannel: Send + Sync {
    /// Forward every inbound payload to `inbound` until [`detach`](Self::detach).
    fn listen(&self, inbound: UnboundedSender<String>) -> Result<(), TransportError>;

    fn post(&self, payload: &str) -> Result<(), TransportError>;

    fn detach(&self);
}

pub struct CrossFrameTransport {
    inner: Arc<FrameInner>,
}

struct FrameInner {
    core: TransportCore,
    channel: Arc<dyn FrameChannel>,
}

impl CrossFrameTransport {
    pub fn new(channel: Arc<dyn FrameChannel>) -> Self {
        Self {
            inner: Arc::new(FrameInner {
                core: TransportCore::new(TransportKind::CrossFrame),
                channel,
            }),
        }
    }
}

impl FrameInner {
    fn post(&self, message: &Message) -> Result<(), TransportError> {
        let text = message.to_json()?;
        self.channel.post(&text)?;
        self.core.record_sent();
        Ok(())
    }

    fn flush_pending(&self) {
        let mut queued = self.core.take_pending().into_iter();
        while let Some((id, value)) = queued.next() {
            if let Err(e) = self.post(&Message::component_update(id.clone(), value.clone())) {
                crate::log_error!("Replaying pending update for {} failed: {}", id, e);
                let mut unsent = vec![(id, value)];
                unsent.extend(queued);
                self.core.restore_pending(unsent);
                return;
            }
        }
    }

    fn on_payload(&self, text: &str) {
        match Message::from_json(text) {
            Ok(message) => self.core.handle_inbound(message),
            Err(e) => {
                self.core.record_received();
                crate::log_warn!("Ignoring malformed frame message: {}", e);
            }
        }
    }
}

async fn pump(inner: Arc<FrameInner>, mut inbound: UnboundedReceiver<String>) {
    while let Some(text) = inbound.next().await {
        inner.on_payload(&text);
    }
    crate::log_debug!("Frame listener detached");
}

#[async_trait(?Send)]
impl Transport for CrossFrameTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::CrossFrame
    }

    async fn connect(&self) -> Result<ConnectOutcome, TransportError> {
        if self.inner.core.is_connected() {
            return Ok(ConnectOutcome::ok("already connected"));
        }

        let (tx, rx) = unbounded();
        if let Err(e) = self.inner.channel.listen(tx) {
            self.inner.core.report_error(&e, "frame listen");
            return Err(e);
        }
        runtime::spawn(pump(self.inner.clone(), rx));

        self.inner.core.set_connected(true);
        self.inner.flush_pending();
        Ok(ConnectOutcome::ok("listening to parent frame"))
    }

    fn disconnect(&self) {
        self.inner.channel.detach();
        self.inner.core.set_connected(false);
    }

    fn is_connected(&self) -> bool {
        self.inner.core.is_connected()
    }

    fn get_component_state(&self, id: &str) -> Option<Value> {
        self.inner.core.get_state(id)
    }

    async fn update_component_state(&self, id: &str, value: Value) -> Result<(), TransportError> {
        self.inner.core.set_state(id, value.clone());
        if !self.inner.core.is_connected() {
            self.inner.core.queue_pending(id, value);
            return Err(TransportError::NotConnected);
        }

        if let Err(e) = self.inner.post(&Message::component_update(id, value)) {
            self.inner.core.record_error();
            crate::log_error!("Posting update for {} failed: {}", id, e);
            return Err(e);
        }
        Ok(())
    }

    fn subscribe(&self, subscriber: Subscriber) -> Subscription {
        self.inner.core.subscribe(subscriber)
    }

    fn connection_metrics(&self) -> ConnectionMetrics {
        self.inner.core.metrics()
    }
}
