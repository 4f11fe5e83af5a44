//! Text-frame channel abstraction over the WebSocket transport.
//!
//! The supervisor is written against [`Channel`] and [`Connect`] so a
//! session can be driven end-to-end in tests without a network socket.
//! The production implementation wraps `tokio-tungstenite`, splitting the
//! stream into reader and writer halves so receives and sends do not
//! contend for one lock.

use crate::error::ClientError;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// An open bidirectional text-frame transport.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Transmit one text frame.
    async fn send(&self, frame: String) -> Result<(), ClientError>;

    /// Receive the next text frame. Transport-level pings are answered
    /// internally; a closed connection surfaces as a connectivity error.
    async fn recv(&self) -> Result<String, ClientError>;

    /// Close the channel; best effort.
    async fn close(&self);
}

/// Opens channels; the supervisor calls this on connect and on every
/// reconnect attempt.
#[async_trait]
pub trait Connect: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Channel>, ClientError>;
}

// ---------------------------------------------------------------------------
// tokio-tungstenite implementation
// ---------------------------------------------------------------------------

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct WsChannel {
    writer: Mutex<SplitSink<WsStream, Message>>,
    reader: Mutex<SplitStream<WsStream>>,
}

#[async_trait]
impl Channel for WsChannel {
    async fn send(&self, frame: String) -> Result<(), ClientError> {
        self.writer
            .lock()
            .await
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| ClientError::Connectivity(e.to_string()))
    }

    async fn recv(&self) -> Result<String, ClientError> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                None => return Err(ClientError::Connectivity("channel closed".to_owned())),
                Some(Err(e)) => return Err(ClientError::Connectivity(e.to_string())),
                Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(Vec::from(bytes))
                        .map_err(|e| ClientError::Protocol(format!("non-UTF-8 frame: {e}")));
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = self.writer.lock().await.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    return Err(ClientError::Connectivity("closed by server".to_owned()));
                }
                Some(Ok(_)) => {}
            }
        }
    }

    async fn close(&self) {
        let _ = self.writer.lock().await.close().await;
    }
}

/// Production connector over `tokio-tungstenite`.
///
/// The user agent is threaded through construction rather than set
/// process-wide.
pub struct WsConnector {
    user_agent: String,
}

impl WsConnector {
    pub fn new(user_agent: impl Into<String>) -> Self {
        WsConnector { user_agent: user_agent.into() }
    }
}

#[async_trait]
impl Connect for WsConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Channel>, ClientError> {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;

        let mut request = uri
            .into_client_request()
            .map_err(|e| ClientError::Connectivity(format!("invalid URI '{uri}': {e}")))?;
        request.headers_mut().insert(
            "User-Agent",
            self.user_agent.parse().map_err(
                |e: tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue| {
                    ClientError::Config(format!("invalid user agent: {e}"))
                },
            )?,
        );

        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| ClientError::Connectivity(e.to_string()))?;
        debug!(%uri, "websocket connected");

        let (writer, reader) = ws.split();
        Ok(Arc::new(WsChannel {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        }))
    }
}
