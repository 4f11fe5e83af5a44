//! Request/response correlation.
//!
//! Outgoing requests are stamped with a correlation id; when a response
//! carrying a known id arrives, the matching completion token is resolved
//! with the response (optionally post-processed by a successor chain).
//!
//! # Correlation ids
//! `{base}_{counter}_{name}{op_name}` where `base` is the wall-clock
//! millisecond count at construction and `counter` increments before each
//! assignment. Ids are opaque strings to the server; uniqueness holds for
//! the process lifetime and, to millisecond precision, across processes.

use crate::chain::{Handler, Routed};
use crate::error::ClientError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// One-shot completion token awaited by a `request` caller.
pub type Completion = oneshot::Receiver<Result<Value, ClientError>>;

/// The resolving side of a completion token.
pub type CompletionSender = oneshot::Sender<Result<Value, ClientError>>;

/// A fresh completion token pair.
pub fn completion() -> (CompletionSender, Completion) {
    oneshot::channel()
}

/// Read the value at a slash-delimited path within a message.
pub fn get_path<'a>(message: &'a Value, path: &str) -> Result<&'a Value, ClientError> {
    let mut node = message;
    for part in path.split('/') {
        node = node.get(part).ok_or_else(|| {
            ClientError::InvalidMessage(format!("no field at '{path}' in: {message}"))
        })?;
    }
    Ok(node)
}

/// Write `value` at a slash-delimited path; intermediate nodes must exist.
pub fn set_path(message: &mut Value, path: &str, value: Value) -> Result<(), ClientError> {
    let mut parts: Vec<&str> = path.split('/').collect();
    let leaf = parts.pop().unwrap_or(path);
    let mut node = &mut *message;
    for part in parts {
        node = match node.get_mut(part) {
            Some(next) => next,
            None => {
                return Err(ClientError::InvalidMessage(format!(
                    "cannot set field at '{path}': missing '{part}'"
                )));
            }
        };
    }
    match node.as_object_mut() {
        Some(object) => {
            object.insert(leaf.to_owned(), value);
            Ok(())
        }
        None => Err(ClientError::InvalidMessage(format!(
            "cannot set field at '{path}': parent is not an object"
        ))),
    }
}

struct PendingEntry {
    #[allow(dead_code)] // kept for teardown diagnostics
    request: Value,
    sender: CompletionSender,
}

/// Correlates requests with their eventual responses.
///
/// The resolver owns the pending-request table and exposes a [`Handler`]
/// suitable for use as a router route: responses it does not recognize are
/// passed back so routing can continue.
pub struct RequestResolver {
    base: String,
    counter: AtomicU64,
    name: String,
    op_name_path: Option<String>,
    key_set_path: String,
    key_get_path: String,
    next: Option<Box<dyn Handler>>,
    pending: Mutex<HashMap<String, PendingEntry>>,
}

impl RequestResolver {
    pub fn new(name: &str, key_set_path: &str, key_get_path: &str) -> Self {
        RequestResolver {
            base: chrono::Utc::now().timestamp_millis().to_string(),
            counter: AtomicU64::new(0),
            name: name.to_owned(),
            op_name_path: None,
            key_set_path: key_set_path.to_owned(),
            key_get_path: key_get_path.to_owned(),
            next: None,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Also embed the request's operation name (read from this path) into
    /// generated correlation ids, for diagnostics.
    pub fn with_op_name_path(mut self, path: &str) -> Self {
        self.op_name_path = Some(path.to_owned());
        self
    }

    /// Post-process resolved responses through `next` before completing the
    /// token (e.g. a validator plus a payload extractor).
    pub fn chain(mut self, next: Box<dyn Handler>) -> Self {
        self.next = Some(next);
        self
    }

    fn next_correlation_id(&self, op_name: &str) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}_{}_{}{}", self.base, seq, self.name, op_name)
    }

    /// Stamp `request` with a fresh correlation id and record the token.
    /// Returns the stamped request, ready to transmit.
    pub fn mark(&self, mut request: Value, sender: CompletionSender) -> Result<Value, ClientError> {
        let op_name = match &self.op_name_path {
            Some(path) => match get_path(&request, path)? {
                Value::String(s) => s.clone(),
                other => {
                    return Err(ClientError::InvalidMessage(format!(
                        "operation name is not a string: {other}"
                    )));
                }
            },
            None => String::new(),
        };
        let id = self.next_correlation_id(&op_name);
        set_path(&mut request, &self.key_set_path, Value::String(id.clone()))?;
        self.pending.lock().unwrap().insert(
            id,
            PendingEntry { request: request.clone(), sender },
        );
        Ok(request)
    }

    /// Number of requests still awaiting a response.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Cancel every outstanding token and empty the table.
    pub fn clear(&self) {
        let mut pending = self.pending.lock().unwrap();
        let outstanding = pending.len();
        if outstanding > 0 {
            debug!(outstanding, "cancelling outstanding requests");
        }
        // dropping the senders wakes each awaiting caller with a cancellation
        pending.clear();
    }
}

#[async_trait]
impl Handler for RequestResolver {
    async fn handle(&self, message: Value) -> Result<Routed, ClientError> {
        let id = match get_path(&message, &self.key_get_path) {
            Ok(Value::String(s)) => s.clone(),
            Ok(_) | Err(_) => {
                // no usable correlation key; let routing continue
                return Ok(Routed::Passed);
            }
        };

        // The entry comes out of the table before any completion-side code
        // runs, so a duplicate response is passed, not resolved twice.
        let entry = self.pending.lock().unwrap().remove(&id);
        let Some(entry) = entry else {
            debug!(%id, "response carries an unknown correlation id");
            return Ok(Routed::Passed);
        };

        debug!(%id, "resolving response");
        let resolved = match &self.next {
            Some(next) => match next.handle(message.clone()).await {
                Ok(Routed::Handled(v)) => v,
                // the post chain declined; hand the raw response over
                Ok(Routed::Passed) => message,
                Err(e @ (ClientError::ErrorMessage(_) | ClientError::InvalidMessage(_))) => {
                    // resolved with an error: the caller learns of it
                    // through the token, not through the routing loop
                    let _ = entry.sender.send(Err(e));
                    return Ok(Routed::Handled(message));
                }
                Err(other) => return Err(other),
            },
            None => message,
        };
        // a dropped receiver (timed-out caller) is benign
        let _ = entry.sender.send(Ok(resolved.clone()));
        Ok(Routed::Handled(resolved))
    }
}

/// Validates the `ok` field of a response.
///
/// `"ok"` passes the message through unchanged, `"error"` raises
/// [`ClientError::ErrorMessage`] with the server's detail, anything else
/// (or a missing field) raises [`ClientError::InvalidMessage`].
pub struct ResponseValidator;

#[async_trait]
impl Handler for ResponseValidator {
    async fn handle(&self, message: Value) -> Result<Routed, ClientError> {
        match message.get("ok").and_then(Value::as_str) {
            Some("ok") => Ok(Routed::Handled(message)),
            Some("error") => {
                let detail = message
                    .pointer("/data/error")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .ok_or_else(|| ClientError::InvalidMessage(message.to_string()))?;
                Err(ClientError::ErrorMessage(detail))
            }
            _ => Err(ClientError::InvalidMessage(message.to_string())),
        }
    }
}

/// Extracts the `data` payload of a response.
pub struct DataGetter;

#[async_trait]
impl Handler for DataGetter {
    async fn handle(&self, message: Value) -> Result<Routed, ClientError> {
        match message.get("data") {
            Some(data) => Ok(Routed::Handled(data.clone())),
            None => {
                warn!(%message, "response has no data payload");
                Err(ClientError::InvalidMessage(message.to_string()))
            }
        }
    }
}
