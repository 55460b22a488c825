use std::time::Duration;

use dashwire_shared::png_data_uri;
use serde_json::json;

use super::*;
use crate::transport::testing::{drain, next_matching, record};

/// One link opened through [`FakeDriver`], driven by the test.
struct FakeLink {
    events: UnboundedSender<SocketEvent>,
    commands: UnboundedReceiver<SocketCommand>,
}

impl FakeLink {
    fn emit(&self, event: SocketEvent) {
        self.events.unbounded_send(event).unwrap();
    }

    async fn next_sent(&mut self) -> Value {
        let command = tokio::time::timeout(Duration::from_secs(2), self.commands.next())
            .await
            .expect("timed out waiting for a command")
            .expect("link dropped");
        match command {
            SocketCommand::Send(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a send, got {other:?}"),
        }
    }
}

/// Hands every opened link to the test instead of touching the network.
struct FakeDriver {
    links: Mutex<UnboundedSender<FakeLink>>,
}

impl SocketDriver for FakeDriver {
    fn open(
        &self,
        _url: &str,
        events: UnboundedSender<SocketEvent>,
    ) -> Result<UnboundedSender<SocketCommand>, TransportError> {
        let (commands, rx) = unbounded();
        self.links
            .lock()
            .unbounded_send(FakeLink {
                events,
                commands: rx,
            })
            .map_err(|_| TransportError::channel("test finished"))?;
        Ok(commands)
    }
}

fn fast_config() -> TransportConfig {
    TransportConfig::new("ws://dash.test")
        .with_client_id("client_test")
        .with_connect_timeout(Duration::from_secs(1))
        .with_reconnect(ReconnectConfig {
            max_attempts: 5,
            initial_delay_ms: 1,
            max_delay_ms: 4,
            backoff_multiplier: 2.0,
        })
}

fn transport(config: &TransportConfig) -> (SocketTransport, UnboundedReceiver<FakeLink>) {
    let (tx, rx) = unbounded();
    let driver = FakeDriver {
        links: Mutex::new(tx),
    };
    (SocketTransport::new(config, Arc::new(driver)).unwrap(), rx)
}

async fn next_link(links: &mut UnboundedReceiver<FakeLink>) -> FakeLink {
    tokio::time::timeout(Duration::from_secs(2), links.next())
        .await
        .expect("timed out waiting for the driver to open a link")
        .expect("driver dropped")
}

async fn no_new_link(links: &mut UnboundedReceiver<FakeLink>) {
    let opened = tokio::time::timeout(Duration::from_millis(60), links.next()).await;
    assert!(opened.is_err(), "unexpected link opened");
}

async fn open(transport: &SocketTransport, links: &mut UnboundedReceiver<FakeLink>) -> FakeLink {
    let (outcome, link) = tokio::join!(transport.connect(), async {
        let link = next_link(links).await;
        link.emit(SocketEvent::Opened);
        link
    });
    assert!(outcome.unwrap().success);
    link
}

#[tokio::test]
async fn builds_url_from_endpoint_and_client_id() {
    let (transport, _links) = transport(&fast_config());
    assert_eq!(transport.url(), "ws://dash.test/ws/client_test");
    assert_eq!(transport.phase(), SocketPhase::Disconnected);
}

#[tokio::test]
async fn update_while_connected_writes_cache_and_sends_component_update() {
    let (transport, mut links) = transport(&fast_config());
    let mut link = open(&transport, &mut links).await;

    transport.update_component_state("x", json!(5)).await.unwrap();

    assert_eq!(transport.get_component_state("x"), Some(json!(5)));
    assert_eq!(
        link.next_sent().await,
        json!({"type": "component_update", "states": {"x": 5}})
    );
    assert_eq!(transport.connection_metrics().messages_sent, 1);
}

#[tokio::test]
async fn offline_writes_replay_latest_value_per_component() {
    let (transport, mut links) = transport(&fast_config());

    for (id, value) in [("x", json!(1)), ("y", json!(2)), ("x", json!(3))] {
        let outcome = transport.update_component_state(id, value).await;
        assert_eq!(outcome, Err(TransportError::NotConnected));
    }
    assert_eq!(transport.get_component_state("x"), Some(json!(3)));
    assert_eq!(transport.connection_metrics().pending_updates, 2);

    let mut link = open(&transport, &mut links).await;

    assert_eq!(
        link.next_sent().await,
        json!({"type": "component_update", "states": {"x": 3}})
    );
    assert_eq!(
        link.next_sent().await,
        json!({"type": "component_update", "states": {"y": 2}})
    );
    assert_eq!(transport.connection_metrics().pending_updates, 0);
}

#[tokio::test]
async fn connect_is_idempotent_while_connected() {
    let (transport, mut links) = transport(&fast_config());
    let _link = open(&transport, &mut links).await;

    let outcome = transport.connect().await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.message, "already connected");
    no_new_link(&mut links).await;
}

#[tokio::test]
async fn gives_up_after_reconnect_budget_with_one_error() {
    let (transport, mut links) = transport(&fast_config());
    let (_sub, mut seen) = record(&transport);
    let first = open(&transport, &mut links).await;

    first.emit(SocketEvent::Closed);
    for _ in 0..5 {
        next_link(&mut links).await.emit(SocketEvent::Closed);
    }
    no_new_link(&mut links).await;

    assert_eq!(transport.phase(), SocketPhase::Failed);
    assert!(!transport.is_connected());

    let messages = drain(&mut seen);
    let errors: Vec<_> = messages
        .iter()
        .filter(|m| matches!(m, Message::Error { .. }))
        .collect();
    assert_eq!(errors.len(), 1, "{messages:?}");
    assert_eq!(
        *errors[0],
        Message::error(
            "channel error: gave up after 5 reconnection attempts",
            Some("reconnect".into())
        )
    );
    let statuses: Vec<_> = messages
        .iter()
        .filter(|m| matches!(m, Message::ConnectionStatus { .. }))
        .collect();
    assert_eq!(
        statuses,
        vec![
            &Message::ConnectionStatus { connected: true },
            &Message::ConnectionStatus { connected: false },
        ]
    );

    // A manual connect leaves the failed state with a fresh budget.
    let _link = open(&transport, &mut links).await;
    assert_eq!(transport.phase(), SocketPhase::Connected);
}

#[tokio::test]
async fn reconnect_after_drop_resumes_and_flushes() {
    let (transport, mut links) = transport(&fast_config());
    let first = open(&transport, &mut links).await;

    first.emit(SocketEvent::Closed);
    let mut second = next_link(&mut links).await;
    let outcome = transport.update_component_state("knob", json!(0.5)).await;
    assert_eq!(outcome, Err(TransportError::NotConnected));

    second.emit(SocketEvent::Opened);
    assert_eq!(
        second.next_sent().await,
        json!({"type": "component_update", "states": {"knob": 0.5}})
    );
    assert!(transport.is_connected());
}

#[tokio::test]
async fn png_frames_become_image_updates() {
    let (transport, mut links) = transport(&fast_config());
    let (_sub, mut seen) = record(&transport);
    let link = open(&transport, &mut links).await;

    let frame = BinaryFrame::png("plot", vec![137, 80, 78, 71], Some("Figure 1".into()));
    link.emit(SocketEvent::Binary(frame.encode().unwrap()));

    let message = next_matching(&mut seen, |m| matches!(m, Message::ImageUpdate { .. })).await;
    let uri = png_data_uri(&[137, 80, 78, 71]);
    assert_eq!(
        message,
        Message::ImageUpdate {
            component_id: "plot".into(),
            value: uri.clone(),
            label: Some("Figure 1".into()),
        }
    );
    assert_eq!(transport.get_component_state("plot"), Some(Value::String(uri)));
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_breaking_the_link() {
    let (transport, mut links) = transport(&fast_config());
    let (_sub, mut seen) = record(&transport);
    let link = open(&transport, &mut links).await;

    link.emit(SocketEvent::Text("{not json".into()));
    link.emit(SocketEvent::Binary(vec![0xff]));
    link.emit(SocketEvent::Text(
        r#"{"type":"state_update","component_id":"x","value":7}"#.into(),
    ));

    let message = next_matching(&mut seen, |m| !matches!(m, Message::ConnectionStatus { .. })).await;
    assert_eq!(
        message,
        Message::StateUpdate {
            component_id: "x".into(),
            value: json!(7),
        }
    );
    assert!(transport.is_connected());
    assert_eq!(transport.connection_metrics().messages_received, 3);
}

#[tokio::test]
async fn connect_times_out_when_link_never_opens() {
    let config = fast_config().with_connect_timeout(Duration::from_millis(20));
    let (transport, mut links) = transport(&config);

    let (outcome, mut link) = tokio::join!(transport.connect(), next_link(&mut links));

    assert_eq!(outcome, Err(TransportError::Timeout(Duration::from_millis(20))));
    assert_eq!(transport.phase(), SocketPhase::Disconnected);
    assert_eq!(link.commands.next().await, Some(SocketCommand::Close));

    link.emit(SocketEvent::Closed);
    let _retry = next_link(&mut links).await;
    assert_eq!(transport.phase(), SocketPhase::Connecting);
}

#[tokio::test]
async fn driver_error_rejects_pending_connect() {
    let (transport, mut links) = transport(&fast_config());
    let (_sub, mut seen) = record(&transport);

    let (outcome, _link) = tokio::join!(transport.connect(), async {
        let link = next_link(&mut links).await;
        link.emit(SocketEvent::Error("connection refused".into()));
        link
    });

    assert_eq!(outcome, Err(TransportError::channel("connection refused")));
    let error = next_matching(&mut seen, |m| matches!(m, Message::Error { .. })).await;
    assert_eq!(
        error,
        Message::error("channel error: connection refused", Some("socket".into()))
    );
}

#[tokio::test]
async fn disconnect_closes_link_and_suppresses_reconnect() {
    let (transport, mut links) = transport(&fast_config());
    let (_sub, mut seen) = record(&transport);
    let mut link = open(&transport, &mut links).await;

    transport.disconnect();
    assert_eq!(link.commands.next().await, Some(SocketCommand::Close));
    link.emit(SocketEvent::Closed);
    no_new_link(&mut links).await;

    assert!(!transport.is_connected());
    assert_eq!(transport.phase(), SocketPhase::Disconnected);
    let last_status = drain(&mut seen)
        .into_iter()
        .filter(|m| matches!(m, Message::ConnectionStatus { .. }))
        .last();
    assert_eq!(last_status, Some(Message::ConnectionStatus { connected: false }));

    // Disconnecting twice is harmless.
    transport.disconnect();
}
