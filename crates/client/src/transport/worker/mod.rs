//! Transport backed by an interpreter running inside the page.
//!
//! There is no network peer: every operation is a request to an
//! [`InterpreterBridge`], and any response carrying a `components` payload
//! replaces the rendered tree wholesale.

mod bundle;
#[cfg(target_arch = "wasm32")]
mod wasm;

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashwire_shared::{
    ComponentTree, ConnectOutcome, ConnectionMetrics, Message, TransportError, TransportKind,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Subscriber, Subscription, Transport, TransportCore};
use crate::config::TransportConfig;

pub use bundle::{fetch_bundle, BundleEntry, FileContent, FsBundle};
#[cfg(target_arch = "wasm32")]
pub use wasm::WebWorkerBridge;

/// Reply to any bridge call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Operation specific fields (`components`, `entries`, `snapshot`, ...).
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl BridgeResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            payload: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    /// The component tree, accepting both `{rows: [...]}` and a bare row list.
    pub fn components(&self) -> Option<ComponentTree> {
        match self.payload.get("components")? {
            Value::Array(rows) => Some(ComponentTree::new(rows.clone())),
            other => match serde_json::from_value(other.clone()) {
                Ok(tree) => Some(tree),
                Err(e) => {
                    crate::log_warn!("Ignoring malformed components payload: {}", e);
                    None
                }
            },
        }
    }

    fn into_result(self, operation: &str) -> Result<Self, TransportError> {
        if self.success {
            Ok(self)
        } else {
            let message = self.error.unwrap_or_else(|| "unknown error".to_string());
            Err(TransportError::remote(operation, message))
        }
    }
}

/// Calls into the embedded interpreter.
#[async_trait(?Send)]
pub trait InterpreterBridge {
    async fn initialize(&self) -> Result<BridgeResponse, TransportError>;

    async fn run_script(&self, path: &str) -> Result<BridgeResponse, TransportError>;

    async fn update_component(&self, id: &str, value: Value) -> Result<BridgeResponse, TransportError>;

    async fn load_files(
        &self,
        files: BTreeMap<String, FileContent>,
    ) -> Result<BridgeResponse, TransportError>;

    async fn list_directory(&self, path: &str) -> Result<BridgeResponse, TransportError>;

    async fn export_snapshot(&self) -> Result<BridgeResponse, TransportError>;

    async fn shutdown(&self) -> Result<BridgeResponse, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BridgePhase {
    Idle,
    Starting,
    Ready,
}

pub struct WorkerBridgeTransport {
    core: TransportCore,
    bridge: Box<dyn InterpreterBridge>,
    bundle_url: Option<String>,
    entry_script: String,
    phase: Mutex<BridgePhase>,
}

impl WorkerBridgeTransport {
    pub fn new(config: &TransportConfig, bridge: Box<dyn InterpreterBridge>) -> Self {
        Self {
            core: TransportCore::new(TransportKind::WorkerBridge),
            bridge,
            bundle_url: config.bundle_url.clone(),
            entry_script: config.entry_script.clone(),
            phase: Mutex::new(BridgePhase::Idle),
        }
    }

    /// Turn a failed call or a `success: false` reply into an error, reported
    /// to subscribers under the operation's name.
    fn checked(
        &self,
        operation: &str,
        outcome: Result<BridgeResponse, TransportError>,
    ) -> Result<BridgeResponse, TransportError> {
        let outcome = outcome.and_then(|response| response.into_result(operation));
        match outcome {
            Ok(response) => {
                self.core.record_received();
                Ok(response)
            }
            Err(e) => {
                self.core.report_error(&e, operation);
                Err(e)
            }
        }
    }

    fn ensure_ready(&self) -> Result<(), TransportError> {
        match *self.phase.lock() {
            BridgePhase::Ready => Ok(()),
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Push the full tree carried by `response`, if any.
    fn emit_components(&self, response: &BridgeResponse) {
        if let Some(components) = response.components() {
            self.core.dispatch(&Message::Components { components });
        }
    }

    async fn stage_bundle(&self, bundle: FsBundle) -> Result<String, TransportError> {
        let entrypoint = bundle
            .entrypoint
            .clone()
            .unwrap_or_else(|| self.entry_script.clone());
        let files = match bundle.into_files() {
            Ok(files) => files,
            Err(e) => {
                self.core.report_error(&e, "load_files");
                return Err(e);
            }
        };
        crate::log_info!("Staging {} bundle files", files.len());
        let outcome = self.bridge.load_files(files).await;
        self.core.record_sent();
        self.checked("load_files", outcome)?;
        Ok(entrypoint)
    }

    async fn start(&self) -> Result<(), TransportError> {
        let outcome = self.bridge.initialize().await;
        self.core.record_sent();
        self.checked("initialize", outcome)?;

        let entrypoint = match &self.bundle_url {
            Some(url) => {
                let bundle = match fetch_bundle(url).await {
                    Ok(bundle) => bundle,
                    Err(e) => {
                        self.core.report_error(&e, "fetch_bundle");
                        return Err(e);
                    }
                };
                self.stage_bundle(bundle).await?
            }
            None => self.entry_script.clone(),
        };

        crate::log_info!("Running entry script {}", entrypoint);
        let outcome = self.bridge.run_script(&entrypoint).await;
        self.core.record_sent();
        let response = self.checked("run_script", outcome)?;
        self.emit_components(&response);
        Ok(())
    }

    /// Replay buffered writes through the bridge.
    async fn flush_pending(&self) {
        let mut queued = self.core.take_pending().into_iter();
        while let Some((id, value)) = queued.next() {
            if let Err(e) = self.send_update(&id, value.clone()).await {
                crate::log_error!("Replaying pending update for {} failed: {}", id, e);
                if e.is_connectivity() {
                    let mut unsent = vec![(id, value)];
                    unsent.extend(queued);
                    self.core.restore_pending(unsent);
                    return;
                }
            }
        }
    }

    async fn send_update(&self, id: &str, value: Value) -> Result<(), TransportError> {
        let outcome = self.bridge.update_component(id, value).await;
        self.core.record_sent();
        let response = self.checked("update_component", outcome)?;
        self.emit_components(&response);
        Ok(())
    }

    /// Run another script and re-render from its output.
    pub async fn run_script(&self, path: &str) -> Result<BridgeResponse, TransportError> {
        self.ensure_ready()?;
        let outcome = self.bridge.run_script(path).await;
        self.core.record_sent();
        let response = self.checked("run_script", outcome)?;
        self.emit_components(&response);
        Ok(response)
    }

    /// Write files into the interpreter's filesystem.
    pub async fn load_files(
        &self,
        files: BTreeMap<String, FileContent>,
    ) -> Result<BridgeResponse, TransportError> {
        self.ensure_ready()?;
        let outcome = self.bridge.load_files(files).await;
        self.core.record_sent();
        let response = self.checked("load_files", outcome)?;
        self.emit_components(&response);
        Ok(response)
    }

    pub async fn list_directory(&self, path: &str) -> Result<BridgeResponse, TransportError> {
        self.ensure_ready()?;
        let outcome = self.bridge.list_directory(path).await;
        self.core.record_sent();
        self.checked("list_directory", outcome)
    }

    pub async fn export_snapshot(&self) -> Result<BridgeResponse, TransportError> {
        self.ensure_ready()?;
        let outcome = self.bridge.export_snapshot().await;
        self.core.record_sent();
        self.checked("export_snapshot", outcome)
    }

    /// Stop the interpreter. The transport is disconnected even if the bridge
    /// reports a failure.
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        let outcome = self.bridge.shutdown().await;
        self.core.record_sent();
        self.disconnect();
        self.checked("shutdown", outcome).map(|_| ())
    }
}

#[async_trait(?Send)]
impl Transport for WorkerBridgeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WorkerBridge
    }

    async fn connect(&self) -> Result<ConnectOutcome, TransportError> {
        {
            let mut phase = self.phase.lock();
            let current = *phase;
            match current {
                BridgePhase::Ready => return Ok(ConnectOutcome::ok("already connected")),
                BridgePhase::Starting => {
                    return Ok(ConnectOutcome::ok("interpreter is starting"));
                }
                BridgePhase::Idle => *phase = BridgePhase::Starting,
            }
        }

        if let Err(e) = self.start().await {
            *self.phase.lock() = BridgePhase::Idle;
            return Err(e);
        }

        *self.phase.lock() = BridgePhase::Ready;
        self.core.set_connected(true);
        self.flush_pending().await;
        Ok(ConnectOutcome::ok("interpreter ready"))
    }

    fn disconnect(&self) {
        *self.phase.lock() = BridgePhase::Idle;
        self.core.set_connected(false);
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    fn get_component_state(&self, id: &str) -> Option<Value> {
        self.core.get_state(id)
    }

    async fn update_component_state(&self, id: &str, value: Value) -> Result<(), TransportError> {
        self.core.set_state(id, value.clone());
        if self.ensure_ready().is_err() {
            self.core.queue_pending(id, value);
            return Err(TransportError::NotConnected);
        }
        self.send_update(id, value).await
    }

    fn subscribe(&self, subscriber: Subscriber) -> Subscription {
        self.core.subscribe(subscriber)
    }

    fn connection_metrics(&self) -> ConnectionMetrics {
        self.core.metrics()
    }
}
