//! dashwire - main entry point
//!
//! Mounts the transport provider and shows connection status plus the raw
//! component values. Widget rendering lives elsewhere.

#![allow(non_snake_case)]

use dashwire_client::hooks::{
    use_component_tree, use_connection_state, use_dashboard,
};
use dashwire_client::{DashboardProvider, TransportConfig};
use dashwire_shared::TransportError;
use dioxus::prelude::*;

fn main() {
    // Initialize tracing for desktop
    #[cfg(not(target_arch = "wasm32"))]
    {
        use tracing_subscriber::EnvFilter;
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("dashwire=debug,dashwire_client=debug")),
            )
            .init();
    }

    dioxus::launch(App);
}

#[cfg(not(target_arch = "wasm32"))]
fn load_config() -> Result<TransportConfig, TransportError> {
    TransportConfig::from_env()
}

#[cfg(target_arch = "wasm32")]
fn load_config() -> Result<TransportConfig, TransportError> {
    TransportConfig::from_location()
}

#[component]
fn App() -> Element {
    let config = use_hook(load_config);

    match config {
        Ok(config) => rsx! {
            DashboardProvider { config,
                StatusBar {}
                ComponentList {}
            }
        },
        Err(e) => rsx! {
            p { class: "dashwire-error", "Invalid configuration: {e}" }
        },
    }
}

#[component]
fn StatusBar() -> Element {
    let status = use_connection_state();
    let dashboard = use_dashboard();
    let label = if status.connected { "connected" } else { "disconnected" };

    rsx! {
        header { class: "dashwire-status",
            span { "{label} via {status.transport}" }
            span { " · {status.metrics.messages_received} in / {status.metrics.messages_sent} out" }
            if let Some(error) = status.last_error {
                span { class: "dashwire-error", " {error.message}" }
            }
            if !status.connected {
                button { onclick: move |_| dashboard.reconnect(), "Reconnect" }
            }
        }
    }
}

#[component]
fn ComponentList() -> Element {
    let dashboard = use_dashboard();
    let ids: Vec<String> = use_component_tree()
        .map(|tree| tree.component_values().into_iter().map(|(id, _)| id).collect())
        .unwrap_or_default();

    rsx! {
        ul { class: "dashwire-components",
            for id in ids {
                li { key: "{id}",
                    "{id}: "
                    code { {dashboard.store.value(&id).map(|v| v.to_string()).unwrap_or_default()} }
                }
            }
        }
    }
}
