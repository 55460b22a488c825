//! `postMessage` channel to `window.parent`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashwire_shared::TransportError;
use futures_channel::mpsc::UnboundedSender;
use parking_lot::Mutex;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::MessageEvent;

use super::FrameChannel;

/// The browser side of [`FrameChannel`].
///
/// The window listener is installed once and lives as long as the page; it
/// forwards to whichever sender is currently attached.
#[derive(Default)]
pub struct ParentFrame {
    listener: Arc<Mutex<Option<UnboundedSender<String>>>>,
    installed: AtomicBool,
}

impl ParentFrame {
    fn install(&self) -> Result<(), TransportError> {
        if self.installed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let window = web_sys::window().ok_or_else(|| TransportError::channel("no window"))?;

        let listener = self.listener.clone();
        let on_message = Closure::wrap(Box::new(move |event: MessageEvent| {
            let data = event.data();
            let text = match data.as_string() {
                Some(text) => text,
                None => match js_sys::JSON::stringify(&data).ok().and_then(|s| s.as_string()) {
                    Some(text) => text,
                    None => {
                        crate::log_warn!("Ignoring frame message that is not JSON");
                        return;
                    }
                },
            };
            if let Some(tx) = listener.lock().as_ref() {
                let _ = tx.unbounded_send(text);
            }
        }) as Box<dyn FnMut(MessageEvent)>);

        window
            .add_event_listener_with_callback("message", on_message.as_ref().unchecked_ref())
            .map_err(|e| {
                self.installed.store(false, Ordering::SeqCst);
                TransportError::channel(format!("failed to listen for messages: {:?}", e))
            })?;
        on_message.forget();
        Ok(())
    }
}

impl FrameChannel for ParentFrame {
    fn listen(&self, inbound: UnboundedSender<String>) -> Result<(), TransportError> {
        *self.listener.lock() = Some(inbound);
        self.install()
    }

    fn post(&self, payload: &str) -> Result<(), TransportError> {
        let parent = web_sys::window()
            .and_then(|w| w.parent().ok().flatten())
            .ok_or_else(|| TransportError::channel("no parent window"))?;
        let message = js_sys::JSON::parse(payload)
            .map_err(|e| TransportError::channel(format!("unserializable message: {:?}", e)))?;
        parent
            .post_message(&message, "*")
            .map_err(|e| TransportError::channel(format!("postMessage failed: {:?}", e)))
    }

    fn detach(&self) {
        self.listener.lock().take();
    }
}
