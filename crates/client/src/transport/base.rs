//! State and fan-out shared by all transports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashwire_shared::{ConnectionMetrics, Message, TransportError, TransportKind};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use super::{Subscriber, SubscriberList, Subscription};

/// Cache, pending buffer, counters and subscribers of one transport.
///
/// Transports own a `TransportCore` instead of inheriting from it. Locks are
/// only held for the duration of a single read or write, never while calling
/// subscribers, so callbacks may read the cache freely.
pub struct TransportCore {
    kind: TransportKind,
    subscribers: Arc<SubscriberList>,
    next_subscriber: AtomicU64,
    states: RwLock<HashMap<String, Value>>,
    pending: Mutex<Vec<(String, Value)>>,
    stats: Mutex<Stats>,
}

#[derive(Default)]
struct Stats {
    connected: bool,
    connected_at: Option<DateTime<Utc>>,
    last_activity: Option<DateTime<Utc>>,
    messages_sent: u64,
    messages_received: u64,
    errors: u64,
}

impl TransportCore {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_subscriber: AtomicU64::new(1),
            states: RwLock::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            stats: Mutex::new(Stats::default()),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    // --- Subscribers ---

    pub fn subscribe(&self, subscriber: Subscriber) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push((id, subscriber));
        Subscription::new(id, Arc::downgrade(&self.subscribers))
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver `message` to every subscriber.
    ///
    /// A failing subscriber is logged and counted; the rest still run.
    pub fn broadcast(&self, message: &Message) {
        let targets: Vec<Subscriber> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, s)| s.clone())
            .collect();

        for subscriber in targets {
            if let Err(e) = subscriber(message) {
                crate::log_error!(
                    "{} subscriber failed on `{}`: {:#}",
                    self.kind,
                    message.kind(),
                    e
                );
                self.stats.lock().errors += 1;
            }
        }
    }

    /// Account for an inbound message, update the cache, then fan out.
    pub fn handle_inbound(&self, message: Message) {
        self.record_received();
        self.dispatch(&message);
    }

    /// Update the cache and fan out without touching the counters.
    pub fn dispatch(&self, message: &Message) {
        self.apply(message);
        self.broadcast(message);
    }

    /// Cache effects of an inbound message.
    fn apply(&self, message: &Message) {
        match message {
            Message::InitialState { states } => {
                let mut cache = self.states.write();
                cache.clear();
                cache.extend(states.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Message::StateUpdate {
                component_id,
                value,
            } => {
                self.states
                    .write()
                    .insert(component_id.clone(), value.clone());
            }
            Message::Components { components } => {
                let values = components.component_values();
                self.states.write().extend(values);
            }
            Message::ImageUpdate {
                component_id,
                value,
                ..
            } => {
                self.states
                    .write()
                    .insert(component_id.clone(), Value::String(value.clone()));
            }
            Message::Unknown { kind, .. } => {
                crate::log_debug!("{}: passing through unknown message type `{}`", self.kind, kind);
            }
            _ => {}
        }
    }

    // --- Component state cache ---

    pub fn get_state(&self, id: &str) -> Option<Value> {
        self.states.read().get(id).cloned()
    }

    pub fn set_state(&self, id: &str, value: Value) {
        self.states.write().insert(id.to_string(), value);
    }

    pub fn states(&self) -> HashMap<String, Value> {
        self.states.read().clone()
    }

    // --- Pending updates ---

    /// Buffer a write made while disconnected. A newer value for the same id
    /// replaces the older one in place.
    pub fn queue_pending(&self, id: &str, value: Value) {
        let mut pending = self.pending.lock();
        match pending.iter_mut().find(|(k, _)| k == id) {
            Some(slot) => slot.1 = value,
            None => pending.push((id.to_string(), value)),
        }
    }

    pub fn take_pending(&self) -> Vec<(String, Value)> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Put back entries that could not be replayed, ahead of anything queued
    /// since. Entries superseded by a newer write are dropped.
    pub fn restore_pending(&self, unsent: Vec<(String, Value)>) {
        let mut pending = self.pending.lock();
        let newer = std::mem::take(&mut *pending);
        for (id, value) in unsent {
            let value = newer
                .iter()
                .find(|(k, _)| *k == id)
                .map(|(_, v)| v.clone())
                .unwrap_or(value);
            pending.push((id, value));
        }
        for (id, value) in newer {
            if !pending.iter().any(|(k, _)| *k == id) {
                pending.push((id, value));
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    // --- Connection state ---

    pub fn is_connected(&self) -> bool {
        self.stats.lock().connected
    }

    /// Record connectivity; emits `connection_status` only when it flips.
    pub fn set_connected(&self, connected: bool) {
        {
            let mut stats = self.stats.lock();
            if stats.connected == connected {
                return;
            }
            stats.connected = connected;
            stats.connected_at = connected.then(Utc::now);
        }
        crate::log_info!(
            "{} transport {}",
            self.kind,
            if connected { "connected" } else { "disconnected" }
        );
        self.broadcast(&Message::ConnectionStatus { connected });
    }

    // --- Counters and errors ---

    pub fn record_sent(&self) {
        let mut stats = self.stats.lock();
        stats.messages_sent += 1;
        stats.last_activity = Some(Utc::now());
    }

    pub fn record_received(&self) {
        let mut stats = self.stats.lock();
        stats.messages_received += 1;
        stats.last_activity = Some(Utc::now());
    }

    pub fn record_error(&self) {
        self.stats.lock().errors += 1;
    }

    /// Count, log and broadcast an error as an `error` message.
    pub fn report_error(&self, error: &TransportError, context: &str) {
        self.record_error();
        crate::log_error!("{} {}: {}", self.kind, context, error);
        self.broadcast(&Message::error(error.to_string(), Some(context.to_string())));
    }

    pub fn metrics(&self) -> ConnectionMetrics {
        let pending_updates = self.pending_len();
        let stats = self.stats.lock();
        let uptime_ms = match (stats.connected, stats.connected_at) {
            (true, Some(since)) => (Utc::now() - since).num_milliseconds().max(0) as u64,
            _ => 0,
        };
        ConnectionMetrics {
            connected: stats.connected,
            transport: self.kind,
            last_activity: stats.last_activity,
            pending_updates,
            messages_sent: stats.messages_sent,
            messages_received: stats.messages_received,
            errors: stats.errors,
            uptime_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::subscriber;
    use dashwire_shared::ComponentTree;
    use serde_json::json;

    fn collector(core: &TransportCore) -> (Subscription, Arc<Mutex<Vec<Message>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = core.subscribe(subscriber(move |msg| {
            sink.lock().push(msg.clone());
            Ok(())
        }));
        (sub, seen)
    }

    #[test]
    fn failing_subscriber_does_not_starve_others() {
        let core = TransportCore::new(TransportKind::Socket);
        let _failing = core.subscribe(subscriber(|_| anyhow::bail!("render blew up")));
        let (_sub, seen) = collector(&core);

        core.handle_inbound(Message::StateUpdate {
            component_id: "x".into(),
            value: json!(1),
        });

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(core.metrics().errors, 1);
    }

    #[test]
    fn initial_state_replaces_the_cache() {
        let core = TransportCore::new(TransportKind::Socket);
        core.set_state("stale", json!(true));

        let mut states = serde_json::Map::new();
        states.insert("a".into(), json!(1));
        states.insert("b".into(), json!("two"));
        core.handle_inbound(Message::InitialState { states });

        assert_eq!(core.get_state("a"), Some(json!(1)));
        assert_eq!(core.get_state("b"), Some(json!("two")));
        assert_eq!(core.get_state("stale"), None);
        assert_eq!(core.get_state("missing"), None);
    }

    #[test]
    fn components_cache_only_id_value_pairs() {
        let core = TransportCore::new(TransportKind::CrossFrame);
        let tree = ComponentTree::new(vec![
            json!([{"id": "slider", "value": 10}, {"id": "label"}]),
            json!([{"value": "anonymous"}, {"id": "toggle", "value": false}]),
        ]);
        core.handle_inbound(Message::Components { components: tree });

        let states = core.states();
        assert_eq!(states.len(), 2);
        assert_eq!(states["slider"], json!(10));
        assert_eq!(states["toggle"], json!(false));
    }

    #[test]
    fn subscribers_see_fresh_cache_during_fan_out() {
        let core = Arc::new(TransportCore::new(TransportKind::Socket));
        let observed = Arc::new(Mutex::new(None));
        let reader = core.clone();
        let slot = observed.clone();
        let _sub = core.subscribe(subscriber(move |_| {
            *slot.lock() = reader.get_state("x");
            Ok(())
        }));

        core.handle_inbound(Message::StateUpdate {
            component_id: "x".into(),
            value: json!(9),
        });
        assert_eq!(*observed.lock(), Some(json!(9)));
    }

    #[test]
    fn pending_keeps_latest_value_in_first_write_order() {
        let core = TransportCore::new(TransportKind::Socket);
        core.queue_pending("x", json!(1));
        core.queue_pending("y", json!(2));
        core.queue_pending("x", json!(3));
        assert_eq!(core.pending_len(), 2);
        assert_eq!(
            core.take_pending(),
            vec![("x".to_string(), json!(3)), ("y".to_string(), json!(2))]
        );
        assert_eq!(core.pending_len(), 0);
    }

    #[test]
    fn restored_pending_goes_first_unless_superseded() {
        let core = TransportCore::new(TransportKind::Socket);
        core.queue_pending("late", json!("new"));
        core.queue_pending("a", json!("newer"));
        core.restore_pending(vec![("a".into(), json!("older")), ("b".into(), json!(1))]);
        assert_eq!(
            core.take_pending(),
            vec![
                ("a".to_string(), json!("newer")),
                ("b".to_string(), json!(1)),
                ("late".to_string(), json!("new")),
            ]
        );
    }

    #[test]
    fn connection_status_only_on_transitions() {
        let core = TransportCore::new(TransportKind::Socket);
        let (_sub, seen) = collector(&core);

        core.set_connected(false);
        core.set_connected(true);
        core.set_connected(true);
        core.set_connected(false);

        let statuses: Vec<bool> = seen
            .lock()
            .iter()
            .filter_map(|m| match m {
                Message::ConnectionStatus { connected } => Some(*connected),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![true, false]);
    }

    #[test]
    fn report_error_broadcasts_and_counts() {
        let core = TransportCore::new(TransportKind::WorkerBridge);
        let (_sub, seen) = collector(&core);

        core.report_error(&TransportError::channel("worker crashed"), "bridge");

        let seen = seen.lock();
        assert_eq!(
            seen.as_slice(),
            &[Message::error("channel error: worker crashed", Some("bridge".into()))]
        );
        assert_eq!(core.metrics().errors, 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let core = TransportCore::new(TransportKind::Socket);
        let (sub, seen) = collector(&core);
        sub.unsubscribe();
        assert_eq!(core.subscriber_count(), 0);

        core.broadcast(&Message::ConnectionStatus { connected: true });
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn metrics_track_traffic() {
        let core = TransportCore::new(TransportKind::Socket);
        assert_eq!(core.metrics().last_activity, None);

        core.record_sent();
        core.handle_inbound(Message::ConnectionsUpdate {
            connections: vec![json!({"name": "warehouse"})],
        });
        core.queue_pending("x", json!(1));
        core.set_connected(true);

        let metrics = core.metrics();
        assert!(metrics.connected);
        assert_eq!(metrics.messages_sent, 1);
        assert_eq!(metrics.messages_received, 1);
        assert_eq!(metrics.pending_updates, 1);
        assert!(metrics.last_activity.is_some());
    }
}
