//! Websocket transport carrying framed server events.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

use crate::retry::with_timeout;
use crate::stream::client::EventStreamOptions;
use crate::stream::proto::SocketFrame;
use crate::stream::transport::{Connector, SignalSink, TaskTransport, Transport, TransportSignal};

/// Opens one websocket per adapter. A websocket never recovers by itself, so
/// every failure ends in [`TransportSignal::Closed`].
#[derive(Clone, Debug)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(options: &EventStreamOptions) -> Self {
        Self {
            connect_timeout: options.connect_timeout,
        }
    }
}

impl Connector for WsConnector {
    fn connect(&self, endpoint: &str, sink: SignalSink) -> Box<dyn Transport> {
        let task = tokio::spawn(run_socket(endpoint.to_string(), self.connect_timeout, sink));
        Box::new(TaskTransport::new(task))
    }
}

async fn run_socket(endpoint: String, connect_timeout: Duration, sink: SignalSink) {
    let request = match endpoint.as_str().into_client_request() {
        Ok(request) => request,
        Err(err) => {
            sink.send(TransportSignal::Error(err.to_string()));
            sink.send(TransportSignal::Closed("invalid websocket request".to_string()));
            return;
        }
    };

    let mut socket = match with_timeout(connect_timeout, connect_async(request)).await {
        Ok(Ok((socket, _))) => socket,
        Ok(Err(err)) => {
            sink.send(TransportSignal::Error(err.to_string()));
            sink.send(TransportSignal::Closed("websocket handshake failed".to_string()));
            return;
        }
        Err(_) => {
            sink.send(TransportSignal::Error(format!(
                "no websocket handshake within {connect_timeout:?}"
            )));
            sink.send(TransportSignal::Closed("websocket handshake timed out".to_string()));
            return;
        }
    };

    if !sink.send(TransportSignal::Open) {
        let _ = socket.close(None).await;
        return;
    }

    let reason = loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => match SocketFrame::parse(&text) {
                Ok(frame) => {
                    let delivered = sink.send(TransportSignal::Event {
                        name: frame.event,
                        data: frame.data,
                        id: Some(frame.id),
                    });
                    if !delivered {
                        let _ = socket.close(None).await;
                        return;
                    }
                }
                Err(err) => warn!(
                    event = "socket_frame_invalid",
                    generation = sink.generation(),
                    error = %err
                ),
            },
            Some(Ok(Message::Ping(payload))) => {
                if let Err(err) = socket.send(Message::Pong(payload)).await {
                    sink.send(TransportSignal::Error(err.to_string()));
                    break "pong failed".to_string();
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|frame| format!("closed by server: {} {}", frame.code, frame.reason))
                    .unwrap_or_else(|| "closed by server".to_string());
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                sink.send(TransportSignal::Error(err.to_string()));
                break "websocket receive failed".to_string();
            }
            None => break "websocket stream ended".to_string(),
        }
    };

    sink.send(TransportSignal::Closed(reason));
}
