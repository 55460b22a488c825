//! Picks and builds the transport for the current session.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use dashwire_shared::{TransportError, TransportKind};

use super::frame::{CrossFrameTransport, FrameChannel};
use super::socket::{SocketDriver, SocketTransport};
use super::worker::{InterpreterBridge, WorkerBridgeTransport};
use super::Transport;
use crate::config::TransportConfig;

/// Builds the interpreter bridge on first use.
pub type BridgeBuilder =
    Box<dyn Fn(&TransportConfig) -> Result<Box<dyn InterpreterBridge>, TransportError>>;

/// Where the dashboard page lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    TopLevel,
    /// Inside an iframe of another page.
    Embedded,
}

impl Environment {
    #[cfg(target_arch = "wasm32")]
    pub fn detect() -> Self {
        let Some(window) = web_sys::window() else {
            return Environment::TopLevel;
        };
        match window.top() {
            Ok(Some(top)) if !js_sys::Object::is(&top, &window) => Environment::Embedded,
            Ok(_) => Environment::TopLevel,
            // Reading `top` across origins can throw, which also means we are framed.
            Err(_) => Environment::Embedded,
        }
    }

    #[cfg(not(target_arch = "wasm32"))]
    pub fn detect() -> Self {
        Environment::TopLevel
    }

    fn default_transport(self) -> TransportKind {
        match self {
            Environment::TopLevel => TransportKind::Socket,
            Environment::Embedded => TransportKind::CrossFrame,
        }
    }
}

pub struct TransportFactory {
    config: TransportConfig,
    environment: Environment,
    socket_driver: Option<Arc<dyn SocketDriver>>,
    frame_channel: Option<Arc<dyn FrameChannel>>,
    bridge_builder: Option<BridgeBuilder>,
    worker: RefCell<Option<Rc<WorkerBridgeTransport>>>,
}

impl TransportFactory {
    pub fn new(config: TransportConfig) -> Self {
        let factory = Self {
            config,
            environment: Environment::detect(),
            socket_driver: None,
            frame_channel: None,
            bridge_builder: None,
            worker: RefCell::new(None),
        };
        factory.with_platform_defaults()
    }

    #[cfg(target_arch = "wasm32")]
    fn with_platform_defaults(self) -> Self {
        use super::frame::ParentFrame;
        use super::worker::WebWorkerBridge;

        self.with_frame_channel(Arc::new(ParentFrame::default()))
            .with_bridge(|config| {
                let bridge = WebWorkerBridge::new(&config.worker_script)?;
                Ok(Box::new(bridge) as Box<dyn InterpreterBridge>)
            })
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn with_platform_defaults(self) -> Self {
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_socket_driver(mut self, driver: Arc<dyn SocketDriver>) -> Self {
        self.socket_driver = Some(driver);
        self
    }

    pub fn with_frame_channel(mut self, channel: Arc<dyn FrameChannel>) -> Self {
        self.frame_channel = Some(channel);
        self
    }

    pub fn with_bridge<F>(mut self, build: F) -> Self
    where
        F: Fn(&TransportConfig) -> Result<Box<dyn InterpreterBridge>, TransportError> + 'static,
    {
        self.bridge_builder = Some(Box::new(build));
        self
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Explicit override first, then what the environment suggests.
    pub fn selected_kind(&self) -> TransportKind {
        self.config
            .transport
            .unwrap_or_else(|| self.environment.default_transport())
    }

    pub fn create(&self) -> Result<Rc<dyn Transport>, TransportError> {
        let kind = self.selected_kind();
        crate::log_info!("Using {} transport ({:?})", kind, self.environment);

        match kind {
            TransportKind::Socket => {
                let transport = match &self.socket_driver {
                    Some(driver) => SocketTransport::new(&self.config, driver.clone())?,
                    None => SocketTransport::with_default_driver(&self.config)?,
                };
                Ok(Rc::new(transport))
            }
            TransportKind::CrossFrame => {
                let channel = self.frame_channel.clone().ok_or_else(|| {
                    TransportError::InvalidConfig(
                        "cross-frame transport needs a frame channel on this platform".into(),
                    )
                })?;
                Ok(Rc::new(CrossFrameTransport::new(channel)))
            }
            TransportKind::WorkerBridge => Ok(self.worker_bridge()?),
        }
    }

    /// The interpreter transport, built once per factory.
    pub fn worker_bridge(&self) -> Result<Rc<WorkerBridgeTransport>, TransportError> {
        if let Some(existing) = self.worker.borrow().as_ref() {
            return Ok(existing.clone());
        }

        let build = self.bridge_builder.as_ref().ok_or_else(|| {
            TransportError::InvalidConfig("worker bridge requested but no interpreter is available".into())
        })?;
        let transport = Rc::new(WorkerBridgeTransport::new(&self.config, build(&self.config)?));
        *self.worker.borrow_mut() = Some(transport.clone());
        Ok(transport)
    }
}
