//! Hooks for components rendered under a [`DashboardProvider`].
//!
//! Components never talk to the transport directly: they read the store, and
//! the provider bumps signals whenever the store changes.
//!
//! [`DashboardProvider`]: crate::provider::DashboardProvider

use dashwire_shared::{ComponentTree, ConnectionMetrics, ErrorContent, TransportKind};
use dioxus::prelude::*;
use serde_json::Value;

use crate::provider::DashboardContext;

/// Snapshot of the session's connectivity.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub connected: bool,
    pub transport: TransportKind,
    pub last_error: Option<ErrorContent>,
    pub metrics: ConnectionMetrics,
}

pub fn use_dashboard() -> DashboardContext {
    use_context::<DashboardContext>()
}

/// Current value of one component. Re-renders on any store change.
pub fn use_component_value(id: &str) -> Option<Value> {
    let ctx = use_dashboard();
    ctx.revision.read();
    ctx.store.value(id)
}

/// Error left by the last failed write to this component.
pub fn use_component_error(id: &str) -> Option<String> {
    let ctx = use_dashboard();
    ctx.revision.read();
    ctx.store.error(id)
}

/// The latest component tree, positional ids included.
pub fn use_component_tree() -> Option<ComponentTree> {
    let ctx = use_dashboard();
    ctx.revision.read();
    ctx.store.tree()
}

pub fn use_connection_state() -> ConnectionState {
    let ctx = use_dashboard();
    let connected = *ctx.connected.read();
    ctx.revision.read();
    ConnectionState {
        connected,
        transport: ctx.transport.kind(),
        last_error: ctx.store.last_error(),
        metrics: ctx.transport.connection_metrics(),
    }
}
