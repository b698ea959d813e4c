//! Session socket transport.
//!
//! A connected socket is handed to the controller as channels so the
//! controller never touches the WebSocket directly. Frames go through a
//! bounded queue and may be dropped; control text (`ping`, `end_session`) is
//! never dropped and is written ahead of queued frames. Dropping both senders
//! closes the socket once the queues drain.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Text(String),
    Closed,
    Error(String),
}

/// An open socket.
pub struct SocketLink {
    /// Bounded; a full queue means the frame is dropped, not awaited
    pub frames: mpsc::Sender<String>,
    pub control: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<SocketLink, TransportError>;
}

/// tokio-tungstenite connector.
pub struct WsConnector {
    outbound_queue: usize,
}

impl WsConnector {
    pub fn new(outbound_queue: usize) -> Self {
        Self {
            outbound_queue: outbound_queue.max(1),
        }
    }
}

#[async_trait]
impl SocketConnector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<SocketLink, TransportError> {
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(TransportError::InvalidUrl(format!("scheme {other}"))),
        }

        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(path = url.path(), "socket open");

        let (mut sink, mut source) = stream.split();
        let (frame_tx, mut frame_rx) = mpsc::channel::<String>(self.outbound_queue);
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<SocketEvent>();

        // writer: control first; ends when both senders are dropped
        tokio::spawn(async move {
            loop {
                let text = tokio::select! {
                    biased;
                    Some(text) = control_rx.recv() => text,
                    Some(text) = frame_rx.recv() => text,
                    else => break,
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!("socket write failed: {e}");
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        });

        // reader: ends on close, error, or when the controller stops listening
        tokio::spawn(async move {
            loop {
                let event = match source.next().await {
                    Some(Ok(Message::Text(text))) => SocketEvent::Text(text),
                    Some(Ok(Message::Close(_))) | None => SocketEvent::Closed,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => SocketEvent::Error(e.to_string()),
                };
                let terminal = !matches!(event, SocketEvent::Text(_));
                if in_tx.send(event).is_err() || terminal {
                    break;
                }
            }
        });

        Ok(SocketLink {
            frames: frame_tx,
            control: control_tx,
            inbound: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_http_scheme() {
        let connector = WsConnector::new(8);
        let url = Url::parse("http://localhost:1/ws/mimic/1").unwrap();
        let err = connector.connect(&url).await.err().unwrap();
        assert!(matches!(err, TransportError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_round_trip_against_local_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            assert_eq!(first, Message::Text("ping".to_string()));
            ws.send(Message::Text(r#"{"type":"session_ended","report":{}}"#.to_string()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        });

        let url = Url::parse(&format!("ws://{}/ws/mimic/42?token=t", addr)).unwrap();
        let mut link = WsConnector::new(4).connect(&url).await.unwrap();
        link.control.send("ping".to_string()).unwrap();

        let first = link.inbound.recv().await.unwrap();
        assert_eq!(
            first,
            SocketEvent::Text(r#"{"type":"session_ended","report":{}}"#.to_string())
        );
        assert_eq!(link.inbound.recv().await.unwrap(), SocketEvent::Closed);
        server.await.unwrap();
    }
}
