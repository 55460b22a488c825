//! Transport configuration.
//!
//! Native builds read `DASHWIRE_*` environment variables; the browser build
//! derives the socket endpoint from the page origin and reads the same keys
//! from the page's query string. Everything can be overridden with the
//! `with_*` builders.

use std::collections::HashMap;
use std::time::Duration;

use dashwire_shared::{TransportError, TransportKind};
use url::Url;

const DEFAULT_ENDPOINT: &str = "ws://localhost:8501";
const DEFAULT_ENTRY_SCRIPT: &str = "app.py";
const DEFAULT_WORKER_SCRIPT: &str = "/worker.js";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnect attempts before giving up
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u32,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u32,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Calculate delay for a given attempt number (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay = self.initial_delay_ms as f32 * self.backoff_multiplier.powi(exponent);
        let capped = delay.min(self.max_delay_ms as f32).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Base socket URL, e.g. `ws://localhost:8501`.
    pub endpoint: String,
    /// Random per-session id, part of the socket path.
    pub client_id: String,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectConfig,
    /// Forces a transport instead of sensing the environment.
    pub transport: Option<TransportKind>,
    /// Filesystem bundle staged into the embedded interpreter.
    pub bundle_url: Option<String>,
    /// Script run when the bundle does not name an entrypoint.
    pub entry_script: String,
    /// Script URL of the interpreter worker.
    pub worker_script: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}

impl TransportConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client_id: generate_client_id(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: ReconnectConfig::default(),
            transport: None,
            bundle_url: None,
            entry_script: DEFAULT_ENTRY_SCRIPT.to_string(),
            worker_script: DEFAULT_WORKER_SCRIPT.to_string(),
        }
    }

    pub fn with_transport(mut self, kind: TransportKind) -> Self {
        self.transport = Some(kind);
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_bundle_url(mut self, url: impl Into<String>) -> Self {
        self.bundle_url = Some(url.into());
        self
    }

    pub fn with_entry_script(mut self, path: impl Into<String>) -> Self {
        self.entry_script = path.into();
        self
    }

    pub fn with_worker_script(mut self, path: impl Into<String>) -> Self {
        self.worker_script = path.into();
        self
    }

    /// Full socket URL: `{endpoint}/ws/{client_id}`.
    pub fn socket_url(&self) -> Result<String, TransportError> {
        let base = Url::parse(&self.endpoint)
            .map_err(|e| TransportError::InvalidConfig(format!("endpoint `{}`: {e}", self.endpoint)))?;
        if !matches!(base.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidConfig(format!(
                "endpoint `{}` must use ws:// or wss://",
                self.endpoint
            )));
        }
        let path = format!(
            "{}/ws/{}",
            base.path().trim_end_matches('/'),
            self.client_id
        );
        let mut url = base;
        url.set_path(&path);
        Ok(url.to_string())
    }

    /// Build a configuration from `DASHWIRE_*` environment variables.
    ///
    /// Environment variables:
    /// - `DASHWIRE_ENDPOINT`: socket base URL (default: "ws://localhost:8501")
    /// - `DASHWIRE_CLIENT_ID`: fixed client id (default: random)
    /// - `DASHWIRE_TRANSPORT`: "socket" | "cross_frame" | "worker_bridge" (default: auto)
    /// - `DASHWIRE_CONNECT_TIMEOUT_MS`: connect timeout (default: 10000)
    /// - `DASHWIRE_MAX_RECONNECT_ATTEMPTS`: reconnect budget (default: 5)
    /// - `DASHWIRE_BUNDLE_URL`: interpreter filesystem bundle (default: none)
    /// - `DASHWIRE_ENTRY_SCRIPT`: interpreter entry script (default: "app.py")
    /// - `DASHWIRE_WORKER_SCRIPT`: interpreter worker script (default: "/worker.js")
    #[cfg(not(target_arch = "wasm32"))]
    pub fn from_env() -> Result<Self, TransportError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an arbitrary key lookup.
    ///
    /// There is no page to resolve against, so `DASHWIRE_BUNDLE_URL` must be
    /// absolute.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, TransportError> {
        Self::from_source(lookup, DEFAULT_ENDPOINT.to_string(), None)
    }

    /// Configuration for a page served at `href`.
    ///
    /// The endpoint defaults to the page origin (http -> ws). `DASHWIRE_*`
    /// query parameters override like environment variables do, and a
    /// relative bundle URL is resolved against the page.
    pub fn from_page_url(href: &str) -> Result<Self, TransportError> {
        let page = Url::parse(href)
            .map_err(|e| TransportError::InvalidConfig(format!("page url `{href}`: {e}")))?;
        let params: HashMap<String, String> = page
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let endpoint = http_to_ws(&page.origin().ascii_serialization());
        Self::from_source(|key| params.get(key).cloned(), endpoint, Some(&page))
    }

    fn from_source(
        lookup: impl Fn(&str) -> Option<String>,
        default_endpoint: String,
        page: Option<&Url>,
    ) -> Result<Self, TransportError> {
        let mut config = Self::new(lookup("DASHWIRE_ENDPOINT").unwrap_or(default_endpoint));

        if let Some(id) = lookup("DASHWIRE_CLIENT_ID").filter(|v| !v.trim().is_empty()) {
            config.client_id = id;
        }
        if let Some(kind) = lookup("DASHWIRE_TRANSPORT") {
            let kind = kind
                .parse::<TransportKind>()
                .map_err(TransportError::InvalidConfig)?;
            config.transport = Some(kind);
        }
        if let Some(ms) = lookup("DASHWIRE_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(parse_number("DASHWIRE_CONNECT_TIMEOUT_MS", &ms)?);
        }
        if let Some(attempts) = lookup("DASHWIRE_MAX_RECONNECT_ATTEMPTS") {
            config.reconnect.max_attempts =
                parse_number("DASHWIRE_MAX_RECONNECT_ATTEMPTS", &attempts)?;
        }
        config.bundle_url = lookup("DASHWIRE_BUNDLE_URL")
            .filter(|v| !v.trim().is_empty())
            .map(|raw| resolve_url(&raw, page))
            .transpose()?;
        if let Some(script) = lookup("DASHWIRE_ENTRY_SCRIPT") {
            config.entry_script = script;
        }
        if let Some(script) = lookup("DASHWIRE_WORKER_SCRIPT") {
            config.worker_script = script;
        }

        // Fail here rather than on the first connect attempt.
        config.socket_url()?;
        Ok(config)
    }

    /// [`from_page_url`](Self::from_page_url) for the current page.
    #[cfg(target_arch = "wasm32")]
    pub fn from_location() -> Result<Self, TransportError> {
        Self::from_page_url(&page_href())
    }
}

#[cfg(target_arch = "wasm32")]
pub(crate) fn page_href() -> String {
    web_sys::window()
        .and_then(|w| w.location().href().ok())
        .unwrap_or_else(|| "http://localhost:8501/".to_string())
}

/// Make `raw` absolute, joining it onto `base` when it is relative.
pub fn resolve_url(raw: &str, base: Option<&Url>) -> Result<String, TransportError> {
    match (Url::parse(raw), base) {
        (Ok(url), _) => Ok(url.to_string()),
        (Err(url::ParseError::RelativeUrlWithoutBase), Some(base)) => base
            .join(raw)
            .map(|url| url.to_string())
            .map_err(|e| TransportError::InvalidConfig(format!("url `{raw}`: {e}"))),
        (Err(url::ParseError::RelativeUrlWithoutBase), None) => Err(TransportError::InvalidConfig(
            format!("url `{raw}` is relative and there is no page to resolve it against"),
        )),
        (Err(e), _) => Err(TransportError::InvalidConfig(format!("url `{raw}`: {e}"))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, TransportError> {
    raw.trim()
        .parse()
        .map_err(|_| TransportError::InvalidConfig(format!("{key} must be a number, got `{raw}`")))
}

/// Convert an HTTP/HTTPS origin to WS/WSS.
pub fn http_to_ws(origin: &str) -> String {
    let origin = origin.trim_end_matches('/');
    if let Some(rest) = origin.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = origin.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        origin.to_string()
    }
}

fn generate_client_id() -> String {
    format!("client_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let reconnect = ReconnectConfig::default();
        let delays: Vec<u64> = (0..7)
            .map(|a| reconnect.delay_for_attempt(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn socket_url_is_keyed_by_client_id() {
        let config = TransportConfig::new("wss://dash.example.com/app/").with_client_id("client_abc");
        assert_eq!(
            config.socket_url().unwrap(),
            "wss://dash.example.com/app/ws/client_abc"
        );
    }

    #[test]
    fn client_ids_are_random() {
        let a = TransportConfig::default();
        let b = TransportConfig::default();
        assert!(a.client_id.starts_with("client_"));
        assert_ne!(a.client_id, b.client_id);
    }

    #[test]
    fn http_endpoints_are_rejected() {
        let err = TransportConfig::new("http://localhost:8501").socket_url().unwrap_err();
        assert!(matches!(err, TransportError::InvalidConfig(_)));
    }

    #[test]
    fn lookup_overrides_defaults() {
        let config = TransportConfig::from_lookup(lookup(&[
            ("DASHWIRE_ENDPOINT", "ws://10.0.0.5:9000"),
            ("DASHWIRE_TRANSPORT", "worker_bridge"),
            ("DASHWIRE_CONNECT_TIMEOUT_MS", "2500"),
            ("DASHWIRE_MAX_RECONNECT_ATTEMPTS", "8"),
            ("DASHWIRE_BUNDLE_URL", "https://cdn.example.com/project_fs.json"),
        ]))
        .unwrap();

        assert_eq!(config.endpoint, "ws://10.0.0.5:9000");
        assert_eq!(config.transport, Some(TransportKind::WorkerBridge));
        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.reconnect.max_attempts, 8);
        assert_eq!(
            config.bundle_url.as_deref(),
            Some("https://cdn.example.com/project_fs.json")
        );
        assert_eq!(config.entry_script, "app.py");
    }

    #[test]
    fn lookup_rejects_garbage() {
        assert!(TransportConfig::from_lookup(lookup(&[("DASHWIRE_TRANSPORT", "smoke")])).is_err());
        assert!(
            TransportConfig::from_lookup(lookup(&[("DASHWIRE_CONNECT_TIMEOUT_MS", "soon")])).is_err()
        );
    }

    #[test]
    fn relative_bundle_url_needs_a_page() {
        let err = TransportConfig::from_lookup(lookup(&[("DASHWIRE_BUNDLE_URL", "/project_fs.json")]))
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidConfig(_)), "{err}");
    }

    #[test]
    fn page_query_overrides_and_resolves_bundle() {
        let config = TransportConfig::from_page_url(
            "https://dash.example.com/app/index.html?DASHWIRE_TRANSPORT=worker_bridge\
             &DASHWIRE_BUNDLE_URL=project_fs.json&DASHWIRE_ENTRY_SCRIPT=main.py\
             &DASHWIRE_WORKER_SCRIPT=%2Fpy%2Fworker.js",
        )
        .unwrap();

        assert_eq!(config.endpoint, "wss://dash.example.com");
        assert_eq!(config.transport, Some(TransportKind::WorkerBridge));
        assert_eq!(
            config.bundle_url.as_deref(),
            Some("https://dash.example.com/app/project_fs.json")
        );
        assert_eq!(config.entry_script, "main.py");
        assert_eq!(config.worker_script, "/py/worker.js");
    }

    #[test]
    fn plain_page_keeps_defaults() {
        let config = TransportConfig::from_page_url("http://localhost:8080/").unwrap();
        assert_eq!(config.endpoint, "ws://localhost:8080");
        assert_eq!(config.transport, None);
        assert_eq!(config.bundle_url, None);
        assert!(TransportConfig::from_page_url("http://localhost/?DASHWIRE_TRANSPORT=smoke").is_err());
    }

    #[test]
    fn urls_resolve_against_the_page() {
        let page = Url::parse("http://localhost:8080/dash/").unwrap();
        assert_eq!(
            resolve_url("/project_fs.json", Some(&page)).unwrap(),
            "http://localhost:8080/project_fs.json"
        );
        assert_eq!(
            resolve_url("http://other.test/b.json", Some(&page)).unwrap(),
            "http://other.test/b.json"
        );
        assert!(resolve_url("/project_fs.json", None).is_err());
    }

    #[test]
    fn origins_map_to_socket_schemes() {
        assert_eq!(http_to_ws("https://dash.example.com/"), "wss://dash.example.com");
        assert_eq!(http_to_ws("http://localhost:8501"), "ws://localhost:8501");
    }
}
