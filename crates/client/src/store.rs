//! Observable component state fed by a transport.
//!
//! The store is what the rendering layer reads. It mirrors the transport's
//! cache, adds a per-component error slot, and keeps the latest tree,
//! configuration and connection information.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashwire_shared::{ComponentTree, ErrorContent, Message, TransportError};
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::transport::{subscriber, Subscription, Transport};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentEntry {
    pub value: Option<Value>,
    /// Last failed write for this component.
    pub error: Option<String>,
}

/// A change observed by store watchers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Component { id: String, entry: ComponentEntry },
    Tree(ComponentTree),
    Config(Map<String, Value>),
    Connections(Vec<Value>),
    Connection(bool),
    Error(ErrorContent),
}

pub type Watcher = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

type WatcherList = RwLock<Vec<(u64, Watcher)>>;

#[derive(Clone, Default)]
pub struct ComponentStore {
    inner: Arc<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    entries: RwLock<HashMap<String, ComponentEntry>>,
    tree: RwLock<Option<ComponentTree>>,
    config: RwLock<Option<Map<String, Value>>>,
    connections: RwLock<Vec<Value>>,
    connected: RwLock<bool>,
    last_error: RwLock<Option<ErrorContent>>,
    watchers: Arc<WatcherList>,
    next_watcher: AtomicU64,
}

/// Registration returned by [`ComponentStore::watch`].
#[must_use = "dropping a WatchHandle keeps the watcher registered; call `cancel` to remove it"]
pub struct WatchHandle {
    id: u64,
    registry: Weak<WatcherList>,
}

impl WatchHandle {
    pub fn cancel(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.write().retain(|(id, _)| *id != self.id);
        }
    }
}

impl ComponentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow `transport` from now on, starting from its connection flag.
    pub fn attach(&self, transport: &dyn Transport) -> Subscription {
        self.set_connected(transport.is_connected());
        let inner = self.inner.clone();
        transport.subscribe(subscriber(move |message| {
            inner.apply(message);
            Ok(())
        }))
    }

    /// Register `watcher`. It first receives the current state, then changes.
    pub fn watch(&self, watcher: impl Fn(&StoreEvent) + Send + Sync + 'static) -> WatchHandle {
        let watcher: Watcher = Arc::new(watcher);
        for event in self.inner.snapshot() {
            watcher(&event);
        }
        let id = self.inner.next_watcher.fetch_add(1, Ordering::Relaxed);
        self.inner.watchers.write().push((id, watcher));
        WatchHandle {
            id,
            registry: Arc::downgrade(&self.inner.watchers),
        }
    }

    /// Apply one message as if it came from the attached transport.
    pub fn apply(&self, message: &Message) {
        self.inner.apply(message);
    }

    /// Write through `transport`, recording the outcome on the component.
    ///
    /// The local value changes right away. A failure, `NotConnected`
    /// included, is stored as the component's error and returned.
    pub async fn update(
        &self,
        transport: &dyn Transport,
        id: &str,
        value: Value,
    ) -> Result<(), TransportError> {
        self.inner.modify(id, |entry| entry.value = Some(value.clone()));
        let outcome = transport.update_component_state(id, value).await;
        match &outcome {
            Ok(()) => self.inner.modify(id, |entry| entry.error = None),
            Err(e) => {
                let error = e.to_string();
                self.inner.modify(id, |entry| entry.error = Some(error.clone()));
            }
        }
        outcome
    }

    pub fn clear_error(&self, id: &str) {
        self.inner.modify(id, |entry| entry.error = None);
    }

    pub fn entry(&self, id: &str) -> Option<ComponentEntry> {
        self.inner.entries.read().get(id).cloned()
    }

    pub fn value(&self, id: &str) -> Option<Value> {
        self.entry(id).and_then(|e| e.value)
    }

    pub fn error(&self, id: &str) -> Option<String> {
        self.entry(id).and_then(|e| e.error)
    }

    /// Latest tree with positional ids filled in.
    pub fn tree(&self) -> Option<ComponentTree> {
        self.inner.tree.read().clone()
    }

    pub fn config(&self) -> Option<Map<String, Value>> {
        self.inner.config.read().clone()
    }

    pub fn connections(&self) -> Vec<Value> {
        self.inner.connections.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.read()
    }

    pub fn last_error(&self) -> Option<ErrorContent> {
        self.inner.last_error.read().clone()
    }

    fn set_connected(&self, connected: bool) {
        self.inner.apply(&Message::ConnectionStatus { connected });
    }
}

impl StoreInner {
    fn notify(&self, event: StoreEvent) {
        let targets: Vec<Watcher> = self.watchers.read().iter().map(|(_, w)| w.clone()).collect();
        for watcher in targets {
            watcher(&event);
        }
    }

    fn modify(&self, id: &str, change: impl FnOnce(&mut ComponentEntry)) {
        let entry = {
            let mut entries = self.entries.write();
            let entry = entries.entry(id.to_string()).or_default();
            change(entry);
            entry.clone()
        };
        self.notify(StoreEvent::Component {
            id: id.to_string(),
            entry,
        });
    }

    fn set_value(&self, id: &str, value: Value) {
        self.modify(id, |entry| entry.value = Some(value));
    }

    fn apply(&self, message: &Message) {
        match message {
            Message::InitialState { states } => self.reset(states),
            Message::StateUpdate {
                component_id,
                value,
            } => self.set_value(component_id, value.clone()),
            Message::ImageUpdate {
                component_id,
                value,
                ..
            } => self.set_value(component_id, Value::String(value.clone())),
            Message::Components { components } => {
                for (id, value) in components.component_values() {
                    self.set_value(&id, value);
                }
                let tree = components.clone().with_positional_ids();
                *self.tree.write() = Some(tree.clone());
                self.notify(StoreEvent::Tree(tree));
            }
            Message::ConnectionsUpdate { connections } => {
                *self.connections.write() = connections.clone();
                self.notify(StoreEvent::Connections(connections.clone()));
            }
            Message::ConnectionStatus { connected } => {
                let changed = {
                    let mut current = self.connected.write();
                    let changed = *current != *connected;
                    *current = *connected;
                    changed
                };
                if changed {
                    self.notify(StoreEvent::Connection(*connected));
                }
            }
            Message::Error { content } => {
                *self.last_error.write() = Some(content.clone());
                self.notify(StoreEvent::Error(content.clone()));
            }
            Message::Config(config) => {
                *self.config.write() = Some(config.clone());
                self.notify(StoreEvent::Config(config.clone()));
            }
            Message::ComponentUpdate { .. } | Message::Unknown { .. } => {}
        }
    }

    /// Replace every value; ids absent from `states` are dropped.
    fn reset(&self, states: &Map<String, Value>) {
        let removed: Vec<String> = {
            let mut entries = self.entries.write();
            let removed = entries
                .keys()
                .filter(|id| !states.contains_key(id.as_str()))
                .cloned()
                .collect();
            entries.clear();
            removed
        };
        for id in removed {
            self.notify(StoreEvent::Component {
                id,
                entry: ComponentEntry::default(),
            });
        }
        for (id, value) in states {
            self.set_value(id, value.clone());
        }
    }

    fn snapshot(&self) -> Vec<StoreEvent> {
        let mut events: Vec<StoreEvent> = self
            .entries
            .read()
            .iter()
            .map(|(id, entry)| StoreEvent::Component {
                id: id.clone(),
                entry: entry.clone(),
            })
            .collect();
        if let Some(tree) = self.tree.read().clone() {
            events.push(StoreEvent::Tree(tree));
        }
        if let Some(config) = self.config.read().clone() {
            events.push(StoreEvent::Config(config));
        }
        events.push(StoreEvent::Connections(self.connections.read().clone()));
        events.push(StoreEvent::Connection(*self.connected.read()));
        if let Some(error) = self.last_error.read().clone() {
            events.push(StoreEvent::Error(error));
        }
        events
    }
}
