//! Pluggable transports between the dashboard and its remote peer.
//!
//! ```text
//!            ┌──────────────────────────────┐
//!            │  Transport (trait)           │
//!            └──────────────────────────────┘
//!                │            │            │
//!        ┌───────┘            │            └────────┐
//!        ▼                    ▼                     ▼
//! ┌───────────────┐  ┌─────────────────┐  ┌─────────────────────┐
//! │SocketTransport│  │CrossFrameTransp.│  │WorkerBridgeTransport│
//! │ (reconnects)  │  │ (parent window) │  │ (embedded interp.)  │
//! └───────────────┘  └─────────────────┘  └─────────────────────┘
//!        │                    │                     │
//!        └────────────┬───────┴─────────────────────┘
//!                     ▼
//!             ┌───────────────┐      fan-out      ┌────────────────┐
//!             │ TransportCore │ ────────────────▶ │ subscribers    │
//!             │ cache/pending │                   │ (store, UI...) │
//!             └───────────────┘                   └────────────────┘
//! ```
//!
//! Every transport owns one [`TransportCore`] and normalizes whatever its
//! channel delivers into [`Message`]s before handing them to the core.

mod base;
pub mod factory;
pub mod frame;
pub mod socket;
pub mod worker;

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use dashwire_shared::{
    BulkItemResult, BulkUpdateReport, ConnectOutcome, ConnectionMetrics, Message, TransportError,
    TransportKind,
};
use parking_lot::RwLock;
use serde_json::Value;

pub use base::TransportCore;
pub use factory::{Environment, TransportFactory};
pub use frame::{CrossFrameTransport, FrameChannel};
pub use socket::{SocketCommand, SocketDriver, SocketEvent, SocketPhase, SocketTransport};
pub use worker::{BridgeResponse, FileContent, InterpreterBridge, WorkerBridgeTransport};

/// Message observer. Returning `Err` is logged and counted, never propagated.
pub type Subscriber = Arc<dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync>;

/// The contract every transport satisfies.
#[async_trait(?Send)]
pub trait Transport {
    fn kind(&self) -> TransportKind;

    /// Establish the channel. Calling it while connected or connecting is a
    /// successful no-op.
    async fn connect(&self) -> Result<ConnectOutcome, TransportError>;

    /// Release channel resources. Safe to call when already disconnected.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Last known value from the local cache. Never performs I/O.
    fn get_component_state(&self, id: &str) -> Option<Value>;

    /// Write a value to the peer.
    ///
    /// The local cache is updated first. While disconnected the value is queued
    /// for replay and [`TransportError::NotConnected`] is returned.
    async fn update_component_state(&self, id: &str, value: Value) -> Result<(), TransportError>;

    /// Observe messages from now on. Current state is not replayed.
    fn subscribe(&self, subscriber: Subscriber) -> Subscription;

    /// Apply updates one by one, collecting individual outcomes.
    ///
    /// A failing item does not stop the batch and applied items are not
    /// rolled back.
    async fn bulk_state_update(&self, updates: Vec<(String, Value)>) -> BulkUpdateReport {
        let started = Utc::now();
        let mut report = BulkUpdateReport::default();

        for (component_id, value) in updates {
            let outcome = self.update_component_state(&component_id, value).await;
            report.total_processed += 1;
            let error = match outcome {
                Ok(()) => {
                    report.success_count += 1;
                    None
                }
                Err(e) => Some(e.to_string()),
            };
            report.results.push(BulkItemResult {
                component_id,
                success: error.is_none(),
                error,
            });
        }

        report.duration_ms = (Utc::now() - started).num_milliseconds().max(0) as u64;
        report
    }

    fn connection_metrics(&self) -> ConnectionMetrics;
}

pub(crate) type SubscriberList = RwLock<Vec<(u64, Subscriber)>>;

/// Handle returned by [`Transport::subscribe`].
#[must_use = "dropping a Subscription keeps the subscriber registered; call `unsubscribe` to remove it"]
pub struct Subscription {
    id: u64,
    registry: Weak<SubscriberList>,
}

impl Subscription {
    pub(crate) fn new(id: u64, registry: Weak<SubscriberList>) -> Self {
        Self { id, registry }
    }

    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.write().retain(|(id, _)| *id != self.id);
        }
    }
}

/// Wrap a closure as a [`Subscriber`].
pub fn subscriber<F>(f: F) -> Subscriber
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}
