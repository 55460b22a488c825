//! Native/Desktop socket driver using tokio-tungstenite.

use dashwire_shared::TransportError;
use futures_channel::mpsc::{unbounded, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use super::{SocketCommand, SocketDriver, SocketEvent};

#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteDriver;

impl SocketDriver for TungsteniteDriver {
    fn open(
        &self,
        url: &str,
        events: UnboundedSender<SocketEvent>,
    ) -> Result<UnboundedSender<SocketCommand>, TransportError> {
        let (commands, mut command_rx) = unbounded::<SocketCommand>();
        let url = url.to_string();

        tokio::spawn(async move {
            let stream = match connect_async(url.as_str()).await {
                Ok((stream, _response)) => stream,
                Err(e) => {
                    let _ = events.unbounded_send(SocketEvent::Error(e.to_string()));
                    let _ = events.unbounded_send(SocketEvent::Closed);
                    return;
                }
            };
            let _ = events.unbounded_send(SocketEvent::Opened);

            let (mut write, mut read) = stream.split();
            loop {
                tokio::select! {
                    frame = read.next() => match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            let _ = events.unbounded_send(SocketEvent::Text(text.to_string()));
                        }
                        Some(Ok(WsMessage::Binary(data))) => {
                            let _ = events.unbounded_send(SocketEvent::Binary(data.to_vec()));
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            crate::log_info!("WebSocket to {} received close", url);
                            break;
                        }
                        Some(Ok(_)) => {
                            // Ping/pong are answered by tungstenite.
                        }
                        Some(Err(e)) => {
                            let _ = events.unbounded_send(SocketEvent::Error(e.to_string()));
                            break;
                        }
                    },
                    command = command_rx.next() => match command {
                        Some(SocketCommand::Send(text)) => {
                            if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                                let _ = events.unbounded_send(SocketEvent::Error(e.to_string()));
                                break;
                            }
                        }
                        Some(SocketCommand::Close) | None => {
                            let _ = write.send(WsMessage::Close(None)).await;
                            break;
                        }
                    },
                }
            }

            let _ = events.unbounded_send(SocketEvent::Closed);
        });

        Ok(commands)
    }
}
