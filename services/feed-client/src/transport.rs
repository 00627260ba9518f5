//! Message transport underneath the client
//!
//! A transport produces one text-frame sink and one text-frame stream per
//! successful connect. `WebSocketTransport` talks TLS WebSocket to the venue;
//! `MemoryTransport` hands each connection to the caller as a
//! `MemorySession`, which is how the client is driven without a network.

use std::pin::Pin;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),
}

/// Outgoing half of a connection.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Incoming half of a connection; ends when the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// Something that can open a bidirectional text-frame connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError>;
}

/// TLS WebSocket connection to the venue endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        debug!(url = %self.url, "WebSocket connected");

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| TransportError::Send(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text))));

        // Control frames are answered by tungstenite itself; only payloads surface.
        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bin)) => String::from_utf8(bin).ok().map(Ok),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => None,
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "WebSocket close frame received");
                    None
                }
                Err(e) => Some(Err(TransportError::Receive(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// Server side of one in-memory connection.
#[derive(Debug)]
pub struct MemorySession {
    /// Frames the client sent, in order.
    pub sent: fmpsc::UnboundedReceiver<String>,
    /// Push frames (or a receive error) to the client.
    pub inbound: fmpsc::UnboundedSender<Result<String, TransportError>>,
}

impl MemorySession {
    /// Next frame the client sent, parsed as JSON.
    pub async fn next_request(&mut self) -> Option<Value> {
        let text = self.sent.next().await?;
        serde_json::from_str(&text).ok()
    }

    /// Next frame the client sent, raw.
    pub async fn next_text(&mut self) -> Option<String> {
        self.sent.next().await
    }

    /// Deliver a JSON reply to the client.
    pub fn reply(&self, value: Value) -> bool {
        self.inbound.unbounded_send(Ok(value.to_string())).is_ok()
    }

    /// Deliver a raw text frame to the client.
    pub fn reply_text(&self, text: impl Into<String>) -> bool {
        self.inbound.unbounded_send(Ok(text.into())).is_ok()
    }

    /// Fail the connection from the server side.
    pub fn fail(&self, reason: &str) -> bool {
        self.inbound
            .unbounded_send(Err(TransportError::Receive(reason.to_string())))
            .is_ok()
    }

    /// Close the connection from the server side.
    pub fn close(self) {
        self.inbound.close_channel();
    }
}

/// In-process transport; every connect yields a fresh `MemorySession`.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    sessions: mpsc::UnboundedSender<MemorySession>,
}

impl MemoryTransport {
    /// The receiver yields one session per client connect.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemorySession>) {
        let (sessions, rx) = mpsc::unbounded_channel();
        (Self { sessions }, rx)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError> {
        let (client_tx, sent) = fmpsc::unbounded::<String>();
        let (inbound, client_rx) = fmpsc::unbounded::<Result<String, TransportError>>();

        self.sessions
            .send(MemorySession { sent, inbound })
            .map_err(|_| TransportError::Connect("no listener for memory sessions".to_string()))?;

        let sink = client_tx.sink_map_err(|e| TransportError::Send(e.to_string()));
        Ok((Box::pin(sink), Box::pin(client_rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_transport_round_trip() {
        let (transport, mut sessions) = MemoryTransport::new();
        let (mut sink, mut stream) = transport.connect().await.unwrap();
        let mut session = sessions.recv().await.unwrap();

        sink.send("{\"ping\":1}".to_string()).await.unwrap();
        assert_eq!(session.next_request().await.unwrap(), json!({"ping": 1}));

        assert!(session.reply(json!({"msg_type": "ping"})));
        let frame = stream.next().await.unwrap().unwrap();
        assert!(frame.contains("ping"));

        session.close();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_memory_transport_without_listener_fails() {
        let (transport, sessions) = MemoryTransport::new();
        drop(sessions);
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::Connect(_))
        ));
    }

    #[test]
    fn test_websocket_transport_url() {
        let transport = WebSocketTransport::new("wss://example.invalid/ws");
        assert_eq!(transport.url(), "wss://example.invalid/ws");
    }
}
