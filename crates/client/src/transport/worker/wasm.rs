//! [`InterpreterBridge`] over a dedicated `web_sys::Worker`.
//!
//! Requests are `{id, method, params}` objects; the worker answers with
//! `{id, result}` where `result` is a [`BridgeResponse`].

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use async_trait::async_trait;
use dashwire_shared::{ProtocolError, TransportError};
use futures_channel::oneshot;
use serde_json::{json, Value};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{MessageEvent, Worker};

use super::{BridgeResponse, FileContent, InterpreterBridge};

type Waiters = Rc<RefCell<HashMap<u64, oneshot::Sender<BridgeResponse>>>>;

pub struct WebWorkerBridge {
    worker: Worker,
    waiters: Waiters,
    next_id: Cell<u64>,
    _on_message: Closure<dyn FnMut(MessageEvent)>,
    _on_error: Closure<dyn FnMut(JsValue)>,
}

impl WebWorkerBridge {
    pub fn new(script_url: &str) -> Result<Self, TransportError> {
        let worker = Worker::new(script_url).map_err(|e| {
            TransportError::InvalidConfig(format!("cannot start worker {script_url}: {:?}", e))
        })?;
        let waiters: Waiters = Rc::new(RefCell::new(HashMap::new()));

        let replies = waiters.clone();
        let on_message = Closure::wrap(Box::new(move |event: MessageEvent| {
            handle_reply(&replies, event.data());
        }) as Box<dyn FnMut(MessageEvent)>);

        let failed = waiters.clone();
        let on_error = Closure::wrap(Box::new(move |event: JsValue| {
            let message = js_sys::Reflect::get(&event, &"message".into())
                .ok()
                .and_then(|v| v.as_string())
                .unwrap_or_else(|| "worker error".to_string());
            crate::log_error!("Interpreter worker error: {}", message);
            for (_, waiter) in failed.borrow_mut().drain() {
                let _ = waiter.send(BridgeResponse::failed(message.clone()));
            }
        }) as Box<dyn FnMut(JsValue)>);

        worker.set_onmessage(Some(on_message.as_ref().unchecked_ref()));
        worker.set_onerror(Some(on_error.as_ref().unchecked_ref()));

        Ok(Self {
            worker,
            waiters,
            next_id: Cell::new(1),
            _on_message: on_message,
            _on_error: on_error,
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<BridgeResponse, TransportError> {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let (tx, rx) = oneshot::channel();
        self.waiters.borrow_mut().insert(id, tx);

        let request = json!({"id": id, "method": method, "params": params}).to_string();
        let posted = js_sys::JSON::parse(&request)
            .and_then(|message| self.worker.post_message(&message));
        if let Err(e) = posted {
            self.waiters.borrow_mut().remove(&id);
            return Err(TransportError::channel(format!("postMessage to worker failed: {:?}", e)));
        }

        rx.await
            .map_err(|_| TransportError::channel(format!("worker dropped `{method}` request")))
    }
}

impl Drop for WebWorkerBridge {
    fn drop(&mut self) {
        self.worker.set_onmessage(None);
        self.worker.set_onerror(None);
        self.worker.terminate();
        self.waiters.borrow_mut().clear();
    }
}

fn handle_reply(waiters: &Waiters, data: JsValue) {
    let Some(text) = js_sys::JSON::stringify(&data).ok().and_then(|s| s.as_string()) else {
        crate::log_warn!("Ignoring non-JSON worker message");
        return;
    };
    let mut reply: Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(e) => {
            crate::log_warn!("Ignoring malformed worker message: {}", e);
            return;
        }
    };
    let Some(id) = reply.get("id").and_then(Value::as_u64) else {
        crate::log_debug!("Worker message without id: {}", text);
        return;
    };
    let Some(waiter) = waiters.borrow_mut().remove(&id) else {
        crate::log_warn!("Worker replied to unknown request {}", id);
        return;
    };

    let response = match reply.get_mut("result").map(Value::take) {
        Some(result) => serde_json::from_value(result).unwrap_or_else(|e| {
            let error = ProtocolError::InvalidPayload {
                kind: "bridge_response".to_string(),
                reason: e.to_string(),
            };
            BridgeResponse::failed(error.to_string())
        }),
        None => {
            let error = reply
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("worker reply has no result");
            BridgeResponse::failed(error)
        }
    };
    let _ = waiter.send(response);
}

#[async_trait(?Send)]
impl InterpreterBridge for WebWorkerBridge {
    async fn initialize(&self) -> Result<BridgeResponse, TransportError> {
        self.call("initialize", Value::Null).await
    }

    async fn run_script(&self, path: &str) -> Result<BridgeResponse, TransportError> {
        self.call("run_script", json!({"path": path})).await
    }

    async fn update_component(&self, id: &str, value: Value) -> Result<BridgeResponse, TransportError> {
        self.call("update_component", json!({"component_id": id, "value": value}))
            .await
    }

    async fn load_files(
        &self,
        files: BTreeMap<String, FileContent>,
    ) -> Result<BridgeResponse, TransportError> {
        let files: serde_json::Map<String, Value> = files
            .iter()
            .map(|(path, content)| (path.clone(), content.to_json()))
            .collect();
        self.call("load_files", json!({"files": files})).await
    }

    async fn list_directory(&self, path: &str) -> Result<BridgeResponse, TransportError> {
        self.call("list_directory", json!({"path": path})).await
    }

    async fn export_snapshot(&self) -> Result<BridgeResponse, TransportError> {
        self.call("export_snapshot", Value::Null).await
    }

    async fn shutdown(&self) -> Result<BridgeResponse, TransportError> {
        let response = self.call("shutdown", Value::Null).await;
        self.worker.terminate();
        response
    }
}
