//! Dioxus glue: one transport and one store per dashboard session.

use std::cell::RefCell;
use std::rc::Rc;

use dioxus::prelude::*;
use futures_channel::mpsc::unbounded;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;

use crate::config::TransportConfig;
use crate::store::{ComponentStore, StoreEvent, WatchHandle};
use crate::transport::{Subscription, Transport, TransportFactory};

/// Context provided by [`DashboardProvider`].
#[derive(Clone)]
pub struct DashboardContext {
    pub transport: Rc<dyn Transport>,
    pub store: ComponentStore,
    /// Bumped on every store change except connectivity.
    pub revision: Signal<u64>,
    pub connected: Signal<bool>,
}

impl DashboardContext {
    /// Send a value from an input handler; failures land on the component's error slot.
    pub fn update(&self, id: impl Into<String>, value: Value) {
        let id = id.into();
        let store = self.store.clone();
        let transport = self.transport.clone();
        spawn(async move {
            if let Err(e) = store.update(transport.as_ref(), &id, value).await {
                crate::log_warn!("Update for {} not delivered: {}", id, e);
            }
        });
    }

    pub fn reconnect(&self) {
        let transport = self.transport.clone();
        spawn(async move {
            if let Err(e) = transport.connect().await {
                crate::log_error!("Reconnect failed: {}", e);
            }
        });
    }
}

thread_local! {
    static SESSION_FACTORY: RefCell<Option<Rc<TransportFactory>>> = const { RefCell::new(None) };
}

/// The page-wide factory for `config`. Provider remounts reuse it, and with it
/// the cached interpreter; a different configuration replaces it.
pub(crate) fn session_factory(config: &TransportConfig) -> Rc<TransportFactory> {
    SESSION_FACTORY.with(|slot| {
        let mut slot = slot.borrow_mut();
        match slot.as_ref() {
            Some(factory) if factory.config() == config => factory.clone(),
            _ => {
                let factory = Rc::new(TransportFactory::new(config.clone()));
                *slot = Some(factory.clone());
                factory
            }
        }
    })
}

/// Everything the provider keeps alive for the session.
struct Session {
    context: DashboardContext,
    subscription: Mutex<Option<Subscription>>,
    watch: Mutex<Option<WatchHandle>>,
}

impl Session {
    fn close(&self) {
        if let Some(watch) = self.watch.lock().take() {
            watch.cancel();
        }
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
        }
        self.context.transport.disconnect();
    }
}

/// Builds the session transport from `config`, keeps a [`ComponentStore`] in
/// sync with it and provides both through [`DashboardContext`].
#[component]
pub fn DashboardProvider(config: TransportConfig, children: Element) -> Element {
    let revision = use_signal(|| 0u64);
    let connected = use_signal(|| false);

    let session = use_hook(move || {
        session_factory(&config).create().map(|transport| {
            let store = ComponentStore::new();
            let subscription = store.attach(transport.as_ref());
            let context = DashboardContext {
                transport,
                store,
                revision,
                connected,
            };
            provide_context(context.clone());
            Rc::new(Session {
                context,
                subscription: Mutex::new(Some(subscription)),
                watch: Mutex::new(None),
            })
        })
    });

    let running = session.clone();
    use_future(move || {
        let running = running.clone();
        async move {
            let Ok(session) = running else {
                return;
            };
            let (tx, mut events) = unbounded::<StoreEvent>();
            let handle = session.context.store.watch(move |event| {
                let _ = tx.unbounded_send(event.clone());
            });
            *session.watch.lock() = Some(handle);

            let transport = session.context.transport.clone();
            spawn(async move {
                if let Err(e) = transport.connect().await {
                    crate::log_error!("Initial connect failed: {}", e);
                }
            });

            let mut revision = session.context.revision;
            let mut connected = session.context.connected;
            while let Some(event) = events.next().await {
                match event {
                    StoreEvent::Connection(is_up) => connected.set(is_up),
                    _ => *revision.write() += 1,
                }
            }
        }
    });

    let closing = session.clone();
    use_drop(move || {
        if let Ok(session) = &closing {
            session.close();
        }
    });

    match session {
        Ok(_) => children,
        Err(e) => {
            crate::log_error!("Dashboard transport unavailable: {}", e);
            rsx! {
                div { class: "dashwire-error", "Unable to start dashboard: {e}" }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_is_kept_for_the_page_session() {
        let config = TransportConfig::default();
        let first = session_factory(&config);
        let remount = session_factory(&config.clone());
        assert!(Rc::ptr_eq(&first, &remount));

        let changed = session_factory(&config.clone().with_entry_script("other.py"));
        assert!(!Rc::ptr_eq(&first, &changed));
        assert_eq!(changed.config().entry_script, "other.py");
    }
}
