//! Socket transport against a real WebSocket server on localhost.

use std::time::Duration;

use dashwire_client::transport::SocketTransport;
use dashwire_client::{subscriber, Transport, TransportConfig};
use dashwire_shared::{png_data_uri, BinaryFrame, Message};
use futures_channel::mpsc::{unbounded, UnboundedReceiver};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;

async fn wait_for(rx: &mut UnboundedReceiver<Message>, pred: impl Fn(&Message) -> bool) -> Message {
    let wait = async {
        while let Some(msg) = rx.next().await {
            if pred(&msg) {
                return msg;
            }
        }
        panic!("transport dropped its subscribers");
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for message")
}

#[tokio::test]
async fn exchanges_state_with_a_live_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        ws.send(WsMessage::Text(
            r#"{"type":"initial_state","states":{"slider":1,"label":"hi"}}"#.into(),
        ))
        .await
        .unwrap();

        let update = loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => break text.to_string(),
                Some(Ok(_)) => continue,
                other => panic!("client went away: {other:?}"),
            }
        };

        let frame = BinaryFrame::png("chart", vec![1, 2, 3], None);
        ws.send(WsMessage::Binary(frame.encode().unwrap().into()))
            .await
            .unwrap();
        ws.close(None).await.unwrap();
        update
    });

    let config = TransportConfig::new(format!("ws://{addr}")).with_client_id("client_it");
    let transport = SocketTransport::with_default_driver(&config).unwrap();
    assert_eq!(transport.url(), format!("ws://{addr}/ws/client_it"));

    let (tx, mut rx) = unbounded();
    let _sub = transport.subscribe(subscriber(move |msg| {
        tx.unbounded_send(msg.clone())?;
        Ok(())
    }));

    let outcome = transport.connect().await.unwrap();
    assert!(outcome.success);

    wait_for(&mut rx, |m| matches!(m, Message::InitialState { .. })).await;
    assert_eq!(transport.get_component_state("slider"), Some(json!(1)));

    transport
        .update_component_state("slider", json!(2))
        .await
        .unwrap();

    let image = wait_for(&mut rx, |m| matches!(m, Message::ImageUpdate { .. })).await;
    assert_eq!(
        image,
        Message::ImageUpdate {
            component_id: "chart".into(),
            value: png_data_uri(&[1, 2, 3]),
            label: None,
        }
    );

    let sent: Value = serde_json::from_str(&server.await.unwrap()).unwrap();
    assert_eq!(sent, json!({"type": "component_update", "states": {"slider": 2}}));

    wait_for(&mut rx, |m| *m == Message::ConnectionStatus { connected: false }).await;
    assert!(!transport.is_connected());

    transport.disconnect();
    let metrics = transport.connection_metrics();
    assert_eq!(metrics.messages_sent, 1);
    assert_eq!(metrics.messages_received, 2);
}
