//! dashwire client - the communication layer of a dashboard frontend.
//!
//! This crate connects a browser (or desktop) dashboard to whatever produces
//! its state: a server over a WebSocket, a parent page over `postMessage`, or
//! an interpreter running in a worker. The rendering layer only sees a
//! [`ComponentStore`] and the hooks in [`hooks`].

pub mod config;
pub mod logging;
pub mod runtime;
pub mod store;
pub mod transport;

pub mod hooks;
pub mod provider;

pub use config::{ReconnectConfig, TransportConfig};
pub use provider::{DashboardContext, DashboardProvider};
pub use store::{ComponentEntry, ComponentStore, StoreEvent};
pub use transport::{
    subscriber, Environment, Subscriber, Subscription, Transport, TransportFactory,
};
