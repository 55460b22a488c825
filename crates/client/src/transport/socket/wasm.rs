//! WASM/Web socket driver using web_sys::WebSocket.

use dashwire_shared::TransportError;
use futures_channel::mpsc::{unbounded, UnboundedSender};
use futures_util::StreamExt;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::spawn_local;
use web_sys::{BinaryType, CloseEvent, ErrorEvent, MessageEvent, WebSocket};

use super::{SocketCommand, SocketDriver, SocketEvent};

#[derive(Debug, Default, Clone, Copy)]
pub struct BrowserSocketDriver;

impl SocketDriver for BrowserSocketDriver {
    fn open(
        &self,
        url: &str,
        events: UnboundedSender<SocketEvent>,
    ) -> Result<UnboundedSender<SocketCommand>, TransportError> {
        let ws = WebSocket::new(url)
            .map_err(|e| TransportError::channel(format!("failed to create WebSocket: {:?}", e)))?;
        ws.set_binary_type(BinaryType::Arraybuffer);

        let on_open_events = events.clone();
        let onopen_callback = Closure::wrap(Box::new(move |_: web_sys::Event| {
            let _ = on_open_events.unbounded_send(SocketEvent::Opened);
        }) as Box<dyn FnMut(web_sys::Event)>);
        ws.set_onopen(Some(onopen_callback.as_ref().unchecked_ref()));
        onopen_callback.forget();

        let on_message_events = events.clone();
        let onmessage_callback = Closure::wrap(Box::new(move |e: MessageEvent| {
            let data = e.data();
            let event = if let Some(text) = data.as_string() {
                SocketEvent::Text(text)
            } else if let Ok(buffer) = data.dyn_into::<js_sys::ArrayBuffer>() {
                SocketEvent::Binary(js_sys::Uint8Array::new(&buffer).to_vec())
            } else {
                crate::log_warn!("Ignoring WebSocket frame of unexpected JS type");
                return;
            };
            let _ = on_message_events.unbounded_send(event);
        }) as Box<dyn FnMut(MessageEvent)>);
        ws.set_onmessage(Some(onmessage_callback.as_ref().unchecked_ref()));
        onmessage_callback.forget();

        let on_error_events = events.clone();
        let onerror_callback = Closure::wrap(Box::new(move |e: ErrorEvent| {
            let reason = if e.message().is_empty() {
                "WebSocket error".to_string()
            } else {
                e.message()
            };
            let _ = on_error_events.unbounded_send(SocketEvent::Error(reason));
        }) as Box<dyn FnMut(ErrorEvent)>);
        ws.set_onerror(Some(onerror_callback.as_ref().unchecked_ref()));
        onerror_callback.forget();

        let onclose_callback = Closure::wrap(Box::new(move |e: CloseEvent| {
            crate::log_info!("WebSocket onclose: code {} {}", e.code(), e.reason());
            let _ = events.unbounded_send(SocketEvent::Closed);
        }) as Box<dyn FnMut(CloseEvent)>);
        ws.set_onclose(Some(onclose_callback.as_ref().unchecked_ref()));
        onclose_callback.forget();

        let (commands, mut command_rx) = unbounded::<SocketCommand>();
        spawn_local(async move {
            while let Some(command) = command_rx.next().await {
                match command {
                    SocketCommand::Send(text) => {
                        if let Err(e) = ws.send_with_str(&text) {
                            crate::log_error!("Send failed: {:?}", e);
                        }
                    }
                    SocketCommand::Close => break,
                }
            }
            // Closing fires `onclose`, which reports `Closed`.
            let _ = ws.close();
        });

        Ok(commands)
    }
}
