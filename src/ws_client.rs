//! Connection supervisor for the realtime session.
//!
//! Owns the channel lifecycle: connect, authenticate, send, receive,
//! heartbeat replies, reconnection with jittered backoff, and subscription
//! replay. One routing loop per client hands every inbound frame to the
//! root router; `set_router` binds a user router as that router's sink, so
//! protocol specials are consumed first and everything else flows on.
//!
//! # Session
//! 1. `connect` opens the channel and expects the `{"e":"connected"}`
//!    greeting within the protocol timeout
//! 2. with authorization on, the signed envelope is exchanged for
//!    `{"e":"auth","ok":"ok",...}`
//! 3. `run` starts the routing loop; server heartbeats (`{"e":"ping"}`)
//!    are answered with `{"e":"pong"}` by the base router
//! 4. a transport failure, a server `{"e":"disconnecting"}`, or a silent
//!    liveness window hands control to the disconnected handler, which
//!    closes the channel and, when enabled, reconnects and replays the
//!    recorded subscriptions in their original order

use crate::chain::{handler_fn, CallChain, Handler, Routed};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::matching;
use crate::resolver::{completion, DataGetter, RequestResolver, ResponseValidator};
use crate::router::MessageRouter;
use crate::signing::WsSigner;
use crate::transport::{Channel, Connect, WsConnector};
use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex as TokioMutex};
use tracing::{debug, error, info, warn};

/// Connection state as observed by user code. Transitions are owned by the
/// supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    Connecting,
    Open,
}

/// Yields a fresh signed auth envelope on demand.
pub type Signer = Arc<dyn Fn() -> Value + Send + Sync>;

/// The connection supervisor.
///
/// Cheap to share by reference; all mutation happens behind internal locks.
/// Exactly one routing loop is ever spawned per client.
pub struct WsClient {
    inner: Arc<Inner>,
    routing: StdMutex<Option<tokio::task::JoinHandle<Result<(), ClientError>>>>,
}

struct Inner {
    weak: Weak<Inner>,
    cfg: ClientConfig,
    connector: Box<dyn Connect>,
    signer: StdMutex<Option<Signer>>,
    channel: StdMutex<Option<Arc<dyn Channel>>>,
    state: watch::Sender<ConnState>,
    /// Held for the duration of a transport send and around each reconnect
    /// attempt, so senders serialize behind reconnection.
    connecting_lock: TokioMutex<()>,
    /// Signals the routing loop that a sender hit a transport error.
    /// Replaced with a fresh token on every connect.
    send_error: StdMutex<watch::Sender<Option<ClientError>>>,
    router: StdMutex<Arc<MessageRouter>>,
    resolver: StdMutex<Option<Arc<RequestResolver>>>,
    send_subscriptions: StdMutex<Vec<Value>>,
    request_subscriptions: StdMutex<Vec<Value>>,
    stop: watch::Sender<bool>,
}

impl WsClient {
    /// A client over the production WebSocket transport.
    pub fn new(cfg: ClientConfig) -> Result<Self, ClientError> {
        let connector = Box::new(WsConnector::new(cfg.user_agent.clone()));
        Self::with_connector(cfg, connector)
    }

    /// A client over a caller-supplied transport; tests drive sessions
    /// through an in-memory connector.
    pub fn with_connector(cfg: ClientConfig, connector: Box<dyn Connect>) -> Result<Self, ClientError> {
        let signer: Option<Signer> = if cfg.authorize {
            let auth = cfg.auth.clone().ok_or_else(|| {
                ClientError::Config("authorize is on but no auth credentials are configured".to_owned())
            })?;
            let ws_signer = WsSigner::new(auth.key, auth.secret);
            Some(Arc::new(move || ws_signer.envelope()))
        } else {
            None
        };

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
            weak: weak.clone(),
            router: StdMutex::new(Arc::new(MessageRouter::new(base_routes(weak.clone())))),
            cfg,
            connector,
            signer: StdMutex::new(signer),
            channel: StdMutex::new(None),
            state: watch::channel(ConnState::Closed).0,
            connecting_lock: TokioMutex::new(()),
            send_error: StdMutex::new(watch::channel(None).0),
            resolver: StdMutex::new(None),
            send_subscriptions: StdMutex::new(Vec::new()),
            request_subscriptions: StdMutex::new(Vec::new()),
            stop: watch::channel(false).0,
        });
        Ok(WsClient { inner, routing: StdMutex::new(None) })
    }

    /// Bind `user_router` as the sink of the base router: protocol specials
    /// are consumed first, everything else flows to the user's routes.
    pub fn set_router(&self, user_router: MessageRouter) {
        let router = MessageRouter::new(base_routes(self.inner.weak.clone()))
            .bind(Arc::new(user_router));
        *self.inner.router.lock().unwrap() = Arc::new(router);
    }

    pub fn set_resolver(&self, resolver: Arc<RequestResolver>) {
        *self.inner.resolver.lock().unwrap() = Some(resolver);
    }

    /// Replace the auth-envelope source (e.g. for delegated signing).
    pub fn set_signer<F>(&self, signer: F)
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        *self.inner.signer.lock().unwrap() = Some(Arc::new(signer));
    }

    pub fn state(&self) -> ConnState {
        *self.inner.state.borrow()
    }

    /// Open the channel and perform the greeting/auth exchange.
    /// Does nothing when the connection is already up.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.inner.connect().await
    }

    /// Connect and start the routing loop.
    pub async fn run(&self) -> Result<(), ClientError> {
        self.inner.connect().await?;
        let mut routing = self.routing.lock().unwrap();
        if routing.is_none() {
            let stop_rx = self.inner.stop.subscribe();
            *routing = Some(tokio::spawn(routing_loop(self.inner.clone(), stop_rx)));
            debug!("routing started");
        }
        Ok(())
    }

    /// Cancel the routing loop and any in-flight receive, close the
    /// channel, and cancel every outstanding request. Terminal.
    pub async fn stop(&self) {
        let _ = self.inner.stop.send_replace(true);
        let handle = self.routing.lock().unwrap().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(self.inner.cfg.protocol_timeout, &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
        if let Some(channel) = self.inner.current_channel() {
            let _ = tokio::time::timeout(self.inner.cfg.timeout, channel.close()).await;
        }
        self.inner.set_state(ConnState::Closed);
        if let Some(resolver) = self.inner.resolver() {
            resolver.clear();
        }
        debug!("client stopped");
    }

    /// Serialize and transmit a message.
    pub async fn send(&self, message: &Value) -> Result<(), ClientError> {
        self.inner.send_value(message).await
    }

    /// Transmit an already-serialized frame verbatim.
    pub async fn send_text(&self, frame: String) -> Result<(), ClientError> {
        self.inner.send_frame(frame).await
    }

    /// Dequeue one decoded message. Used by `connect`, tests, and the
    /// routing loop; not meant to be called while the loop is running.
    pub async fn recv(&self) -> Result<Value, ClientError> {
        let channel = self
            .inner
            .current_channel()
            .ok_or_else(|| ClientError::Connectivity("not connected".to_owned()))?;
        self.inner.recv_on(&channel, self.inner.cfg.timeout).await
    }

    /// Stamp the request with a correlation id, transmit it, and await the
    /// resolved response.
    pub async fn request(&self, message: Value) -> Result<Value, ClientError> {
        self.inner.request_value(message).await
    }

    /// Transmit a fire-and-forget subscription, recording it for replay
    /// after reconnects.
    pub async fn send_subscribe(&self, message: Value) -> Result<(), ClientError> {
        self.inner.send_subscriptions.lock().unwrap().push(message.clone());
        self.inner.send_value(&message).await
    }

    /// Transmit a request-style subscription, recording it for replay
    /// after reconnects.
    pub async fn request_subscribe(&self, message: Value) -> Result<Value, ClientError> {
        self.inner.request_subscriptions.lock().unwrap().push(message.clone());
        self.inner.request_value(message).await
    }
}

// ---------------------------------------------------------------------------
// Supervisor internals
// ---------------------------------------------------------------------------

impl Inner {
    fn set_state(&self, state: ConnState) {
        let _ = self.state.send_replace(state);
    }

    fn state_now(&self) -> ConnState {
        *self.state.borrow()
    }

    fn current_channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel.lock().unwrap().clone()
    }

    fn resolver(&self) -> Option<Arc<RequestResolver>> {
        self.resolver.lock().unwrap().clone()
    }

    fn router(&self) -> Arc<MessageRouter> {
        self.router.lock().unwrap().clone()
    }

    fn signal_send_error(&self, err: &ClientError) {
        let _ = self.send_error.lock().unwrap().send_replace(Some(err.clone()));
    }

    async fn connect(&self) -> Result<(), ClientError> {
        if self.state_now() != ConnState::Closed {
            return Ok(());
        }
        self.set_state(ConnState::Connecting);
        match self.connect_inner().await {
            Ok(()) => {
                self.set_state(ConnState::Open);
                Ok(())
            }
            Err(e) => {
                info!(error = %e, "connect failed");
                if let Some(channel) = self.current_channel() {
                    let _ = tokio::time::timeout(self.cfg.timeout, channel.close()).await;
                }
                self.set_state(ConnState::Closed);
                Err(e)
            }
        }
    }

    async fn connect_inner(&self) -> Result<(), ClientError> {
        let channel = tokio::time::timeout(self.cfg.timeout, self.connector.connect(&self.cfg.uri))
            .await
            .map_err(|_| ClientError::Timeout(format!("connecting to {}", self.cfg.uri)))??;
        *self.channel.lock().unwrap() = Some(channel.clone());

        // fresh send-error token for the new channel
        *self.send_error.lock().unwrap() = watch::channel(None).0;

        let greeting = self.recv_on(&channel, self.cfg.protocol_timeout).await?;
        if !matching::equal_or_greater(&greeting, &json!({"e": "connected"}))? {
            return Err(ClientError::Protocol(format!("connection failed: {greeting}")));
        }
        info!("client connected");

        if self.cfg.authorize {
            self.authorize(&channel).await?;
        }
        Ok(())
    }

    async fn authorize(&self, channel: &Arc<dyn Channel>) -> Result<(), ClientError> {
        let signer = self
            .signer
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ClientError::Config("authorize is on but no signer is set".to_owned()))?;
        let envelope = signer();
        let frame = serde_json::to_string(&envelope)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.transmit(channel, frame).await?;

        let response = self.recv_on(channel, self.cfg.protocol_timeout).await?;
        if matching::equal_or_greater(&response, &json!({"e": "auth", "ok": "ok", "data": {"ok": "ok"}}))? {
            info!("user authorized");
            Ok(())
        } else if matching::equal(&response, &json!({"e": "auth", "ok": "error", "data": {"error": null}}))? {
            let detail = response
                .pointer("/data/error")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_owned();
            Err(ClientError::Auth(detail))
        } else {
            Err(ClientError::Protocol(format!("authentication failed: {response}")))
        }
    }

    /// Transport send with timeout; failures are signalled to the routing
    /// loop and surfaced to the caller as connectivity errors.
    async fn transmit(&self, channel: &Arc<dyn Channel>, frame: String) -> Result<(), ClientError> {
        debug!(frame = %frame, "client sends");
        let err = match tokio::time::timeout(self.cfg.timeout, channel.send(frame)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e,
            Err(_) => ClientError::Connectivity("send timed out".to_owned()),
        };
        self.signal_send_error(&err);
        Err(err)
    }

    async fn send_frame(&self, frame: String) -> Result<(), ClientError> {
        let _guard = self.connecting_lock.lock().await;
        let channel = self
            .current_channel()
            .ok_or_else(|| ClientError::Connectivity("not connected".to_owned()))?;
        self.transmit(&channel, frame).await
    }

    async fn send_value(&self, message: &Value) -> Result<(), ClientError> {
        let frame = serde_json::to_string(message)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.send_frame(frame).await
    }

    async fn recv_on(&self, channel: &Arc<dyn Channel>, bound: Duration) -> Result<Value, ClientError> {
        let frame = tokio::time::timeout(bound, channel.recv())
            .await
            .map_err(|_| ClientError::Timeout("receive".to_owned()))??;
        decode_frame(&frame)
    }

    async fn request_value(&self, message: Value) -> Result<Value, ClientError> {
        let resolver = self
            .resolver()
            .ok_or_else(|| ClientError::Config("no resolver is set".to_owned()))?;
        let (sender, token) = completion();
        let marked = resolver.mark(message, sender)?;
        self.send_value(&marked).await?;
        match tokio::time::timeout(self.cfg.timeout, token).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Cancelled),
            Err(_) => Err(ClientError::Timeout("request".to_owned())),
        }
    }

    /// The disconnected handler. Returns `true` when routing should
    /// continue on a fresh connection.
    async fn handle_disconnect(&self) -> bool {
        self.set_state(ConnState::Closed);
        // cancel the send-error token of the dead channel
        *self.send_error.lock().unwrap() = watch::channel(None).0;
        if let Some(channel) = self.current_channel() {
            let _ = tokio::time::timeout(self.cfg.timeout, channel.close()).await;
        }

        if !self.cfg.reconnect {
            info!("client stopped (reconnect disabled)");
            return false;
        }

        info!("reconnecting");
        loop {
            tokio::time::sleep(reconnect_backoff()).await;
            let attempt = {
                let _guard = self.connecting_lock.lock().await;
                self.connect().await
            };
            match attempt {
                Ok(()) => break,
                Err(e) => info!(error = %e, "reconnect attempt failed"),
            }
        }

        if let Some(inner) = self.weak.upgrade() {
            tokio::spawn(async move { inner.after_connected().await });
        }
        true
    }

    /// Replays the recorded subscriptions on the fresh connection, each
    /// with its original verb and in original registry order.
    async fn after_connected(&self) {
        if !self.cfg.resend_subscriptions {
            return;
        }
        let sends = self.send_subscriptions.lock().unwrap().clone();
        let requests = self.request_subscriptions.lock().unwrap().clone();
        for message in sends {
            if let Err(e) = self.send_value(&message).await {
                info!(error = %e, "subscription replay failed");
                return;
            }
        }
        for message in requests {
            if let Err(e) = self.request_value(message).await {
                info!(error = %e, "subscription replay failed");
                return;
            }
        }
    }
}

fn decode_frame(frame: &str) -> Result<Value, ClientError> {
    let message: Value =
        serde_json::from_str(frame).map_err(|e| ClientError::Protocol(format!("JSON parse: {e}")))?;
    debug!(%message, "server sends");
    Ok(message)
}

fn reconnect_backoff() -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_secs_f64(rng.gen_range(0.1..3.1))
}

// ---------------------------------------------------------------------------
// Routing loop
// ---------------------------------------------------------------------------

async fn routing_loop(
    inner: Arc<Inner>,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<(), ClientError> {
    loop {
        let Some(channel) = inner.current_channel() else {
            if !inner.handle_disconnect().await {
                break;
            }
            continue;
        };
        let mut send_error_rx = inner.send_error.lock().unwrap().subscribe();

        tokio::select! {
            biased;
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    debug!("routing cancelled");
                    return Ok(());
                }
            }
            err = wait_send_error(&mut send_error_rx) => {
                info!(error = %err, "client disconnected while sending");
                if !inner.handle_disconnect().await {
                    break;
                }
            }
            received = tokio::time::timeout(inner.cfg.liveness_window, channel.recv()) => {
                match received {
                    Err(_) => {
                        info!("liveness window elapsed without inbound traffic");
                        if !inner.handle_disconnect().await {
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        info!(error = %e, "client disconnected while receiving");
                        if !inner.handle_disconnect().await {
                            break;
                        }
                    }
                    Ok(Ok(frame)) => {
                        // a wire-format violation is fatal to the session
                        let message = decode_frame(&frame)?;
                        let router = inner.router();
                        match router.handle(message).await {
                            Ok(_) => {}
                            Err(e @ ClientError::Protocol(_)) => {
                                error!(error = %e, "protocol violation; routing aborts");
                                return Err(e);
                            }
                            Err(e) => {
                                info!(error = %e, "handler failure treated as disconnect");
                                if !inner.handle_disconnect().await {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    debug!("routing stopped");
    Ok(())
}

/// Resolves when the current send-error token fires. A replaced token
/// (fresh connection) parks forever; the next loop iteration subscribes to
/// the replacement.
async fn wait_send_error(rx: &mut watch::Receiver<Option<ClientError>>) -> ClientError {
    loop {
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(guard) => Some(guard.as_ref().cloned()),
            Err(_) => None,
        };
        match outcome {
            Some(Some(err)) => return err,
            Some(None) => continue,
            None => std::future::pending::<()>().await,
        }
    }
}

// ---------------------------------------------------------------------------
// Base router: protocol special messages
// ---------------------------------------------------------------------------

fn base_routes(weak: Weak<Inner>) -> Vec<(Value, Arc<dyn Handler>)> {
    vec![
        (
            json!({"e": "connected"}),
            Arc::new(OnConnected(weak.clone())) as Arc<dyn Handler>,
        ),
        (
            json!({"ok": "error", "data": {"error": "Please Login"}}),
            Arc::new(OnNotAuthenticated) as Arc<dyn Handler>,
        ),
        (json!({"e": "ping"}), Arc::new(OnPing(weak.clone())) as Arc<dyn Handler>),
        (
            json!({"e": "disconnecting"}),
            Arc::new(OnDisconnecting(weak)) as Arc<dyn Handler>,
        ),
    ]
}

/// The server re-sent its greeting mid-session: re-authenticate, or simply
/// mark the connection open when no auth is required.
struct OnConnected(Weak<Inner>);

#[async_trait]
impl Handler for OnConnected {
    async fn handle(&self, message: Value) -> Result<Routed, ClientError> {
        let Some(inner) = self.0.upgrade() else {
            return Ok(Routed::Passed);
        };
        info!("connection established");
        if inner.cfg.authorize {
            let signer = inner.signer.lock().unwrap().clone();
            if let Some(signer) = signer {
                inner.send_value(&signer()).await?;
            }
        } else {
            inner.set_state(ConnState::Open);
        }
        Ok(Routed::Handled(message))
    }
}

struct OnNotAuthenticated;

#[async_trait]
impl Handler for OnNotAuthenticated {
    async fn handle(&self, message: Value) -> Result<Routed, ClientError> {
        warn!(%message, "user not authenticated");
        Ok(Routed::Handled(message))
    }
}

struct OnPing(Weak<Inner>);

#[async_trait]
impl Handler for OnPing {
    async fn handle(&self, message: Value) -> Result<Routed, ClientError> {
        if let Some(inner) = self.0.upgrade() {
            inner.send_value(&json!({"e": "pong"})).await?;
        }
        Ok(Routed::Handled(message))
    }
}

struct OnDisconnecting(Weak<Inner>);

#[async_trait]
impl Handler for OnDisconnecting {
    async fn handle(&self, message: Value) -> Result<Routed, ClientError> {
        info!("disconnecting by server");
        if let Some(inner) = self.0.upgrade() {
            // reconnects in place when enabled; otherwise the routing loop
            // winds down on the next receive failure
            inner.handle_disconnect().await;
        }
        Ok(Routed::Handled(message))
    }
}

// ---------------------------------------------------------------------------
// CallbackClient: request/response plus a single notification callback
// ---------------------------------------------------------------------------

/// A supervisor pre-wired for the common shape of exchange traffic:
/// responses carrying an `oid` resolve pending requests through a
/// validator (`ok` field) and payload extractor, and everything else goes
/// to one notification handler.
pub struct CallbackClient {
    client: WsClient,
}

impl CallbackClient {
    pub fn new(cfg: ClientConfig, on_notification: Arc<dyn Handler>) -> Result<Self, ClientError> {
        Self::wire(WsClient::new(cfg)?, on_notification)
    }

    pub fn with_connector(
        cfg: ClientConfig,
        connector: Box<dyn Connect>,
        on_notification: Arc<dyn Handler>,
    ) -> Result<Self, ClientError> {
        Self::wire(WsClient::with_connector(cfg, connector)?, on_notification)
    }

    fn wire(client: WsClient, on_notification: Arc<dyn Handler>) -> Result<Self, ClientError> {
        let resolver = Arc::new(
            RequestResolver::new("", "oid", "oid")
                .with_op_name_path("e")
                .chain(Box::new(
                    CallChain::with(Arc::new(ResponseValidator)).bind(Arc::new(DataGetter)),
                )),
        );
        let router = MessageRouter::new(vec![
            (
                json!({"e": null, "data": null, "oid": null, "ok": null}),
                resolver.clone() as Arc<dyn Handler>,
            ),
            (json!({}), on_notification),
        ])
        .bind(handler_fn(|message| {
            warn!(%message, "unhandled message");
            Ok(Routed::Handled(message))
        }));
        client.set_router(router);
        client.set_resolver(resolver);
        Ok(CallbackClient { client })
    }

    /// A request message in the exchange's `{"e": ..., "data": ...}` shape.
    pub fn format_message(e_name: &str, data: Option<Value>) -> Value {
        let mut message = json!({"e": e_name});
        if let Some(data) = data {
            message["data"] = data;
        }
        message
    }
}

impl std::ops::Deref for CallbackClient {
    type Target = WsClient;

    fn deref(&self) -> &WsClient {
        &self.client
    }
}
