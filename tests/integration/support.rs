//! In-memory `Channel`/`Connect` doubles for driving the supervisor
//! end-to-end without a network socket.
//!
//! `MemoryConnector` produces a fresh channel pair on every connect and
//! hands the server side of each session to the test through an unbounded
//! stream, so reconnect scenarios observe every session in order.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tradewire::{Channel, ClientError, Connect, ConnState, WsClient};

// ---------------------------------------------------------------------------
// Server side of a session
// ---------------------------------------------------------------------------

pub struct ServerEnd {
    to_client: Option<mpsc::UnboundedSender<String>>,
    from_client: mpsc::UnboundedReceiver<String>,
    broken: Arc<AtomicBool>,
}

impl ServerEnd {
    pub fn send_json(&self, message: &Value) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(message.to_string());
        }
    }

    /// The next frame the client transmitted, decoded.
    pub async fn recv_json(&mut self) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(10), self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client side closed");
        serde_json::from_str(&frame).expect("client sent invalid JSON")
    }

    /// True when no frame arrives within a short grace window.
    pub async fn idle(&mut self) -> bool {
        tokio::time::timeout(Duration::from_millis(200), self.from_client.recv())
            .await
            .is_err()
    }

    /// True once the client has closed its side of the channel.
    pub fn link_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Sever the link entirely: the client's pending receive fails and
    /// further sends error out.
    pub fn drop_link(&mut self) {
        self.broken.store(true, Ordering::SeqCst);
        self.to_client = None;
    }

    /// Break only the client's send path, leaving its receive pending.
    pub fn break_writes(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Channel + connector
// ---------------------------------------------------------------------------

struct MemoryChannel {
    inbound: Mutex<mpsc::UnboundedReceiver<String>>,
    outbound: mpsc::UnboundedSender<String>,
    broken: Arc<AtomicBool>,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn send(&self, frame: String) -> Result<(), ClientError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(ClientError::Connectivity("broken pipe".to_owned()));
        }
        self.outbound
            .send(frame)
            .map_err(|_| ClientError::Connectivity("peer gone".to_owned()))
    }

    async fn recv(&self) -> Result<String, ClientError> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| ClientError::Connectivity("channel closed".to_owned()))
    }

    async fn close(&self) {
        self.broken.store(true, Ordering::SeqCst);
        self.inbound.lock().await.close();
    }
}

pub struct MemoryConnector {
    sessions: mpsc::UnboundedSender<ServerEnd>,
    greeting: Option<Value>,
    pub connects: Arc<AtomicUsize>,
}

/// A connector that greets every session with `{"e":"connected"}`, plus
/// the stream of server ends it creates (one per connect).
pub fn memory_connector() -> (MemoryConnector, mpsc::UnboundedReceiver<ServerEnd>) {
    memory_connector_with_greeting(Some(json!({"e": "connected"})))
}

/// A connector with a custom (or absent) greeting.
pub fn memory_connector_with_greeting(
    greeting: Option<Value>,
) -> (MemoryConnector, mpsc::UnboundedReceiver<ServerEnd>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            sessions: tx,
            greeting,
            connects: Arc::new(AtomicUsize::new(0)),
        },
        rx,
    )
}

#[async_trait]
impl Connect for MemoryConnector {
    async fn connect(&self, _uri: &str) -> Result<Arc<dyn Channel>, ClientError> {
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let (from_client_tx, from_client_rx) = mpsc::unbounded_channel();
        let broken = Arc::new(AtomicBool::new(false));

        if let Some(greeting) = &self.greeting {
            let _ = to_client_tx.send(greeting.to_string());
        }
        let server = ServerEnd {
            to_client: Some(to_client_tx),
            from_client: from_client_rx,
            broken: broken.clone(),
        };
        self.sessions
            .send(server)
            .map_err(|_| ClientError::Connectivity("test harness gone".to_owned()))?;
        self.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(MemoryChannel {
            inbound: Mutex::new(to_client_rx),
            outbound: from_client_tx,
            broken,
        }))
    }
}

/// Spin until the client reports an open connection.
pub async fn wait_until_open(client: &WsClient) {
    for _ in 0..500 {
        if client.state() == ConnState::Open {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("client never reached the open state");
}
