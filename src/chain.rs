//! Message handlers and the call chain combinator.

use crate::error::ClientError;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// Outcome of handing a message to a [`Handler`].
///
/// `Passed` is the explicit "not handled" marker, distinct from a handler
/// genuinely producing a `null` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// The message was consumed; carries the (possibly rewritten) result.
    Handled(Value),
    /// The handler declined; routing may continue elsewhere.
    Passed,
}

impl Routed {
    pub fn is_handled(&self) -> bool {
        matches!(self, Routed::Handled(_))
    }

    /// The carried value, if any.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Routed::Handled(v) => Some(v),
            Routed::Passed => None,
        }
    }
}

/// Anything that can process a message: a plain function, a [`CallChain`],
/// a router, or a resolver. Composition is flat; a handler never needs to
/// know what invoked it.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: Value) -> Result<Routed, ClientError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(Value) -> Result<Routed, ClientError> + Send + Sync,
{
    async fn handle(&self, message: Value) -> Result<Routed, ClientError> {
        (self.0)(message)
    }
}

/// Wrap a synchronous function as a [`Handler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Value) -> Result<Routed, ClientError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

struct AsyncFnHandler<F, Fut>(F, PhantomData<fn() -> Fut>);

#[async_trait]
impl<F, Fut> Handler for AsyncFnHandler<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Routed, ClientError>> + Send,
{
    async fn handle(&self, message: Value) -> Result<Routed, ClientError> {
        (self.0)(message).await
    }
}

/// Wrap an asynchronous function as a [`Handler`].
pub fn handler_async<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Routed, ClientError>> + Send + 'static,
{
    Arc::new(AsyncFnHandler(f, PhantomData))
}

/// A single-input single-output transformer chain.
///
/// Each node threads the message through its handler and, when the result
/// is not `Passed`, on through the successor. Construction is append-only:
/// [`CallChain::bind`] attaches at the tail and returns the chain for
/// fluent use. Application errors are never caught here.
pub struct CallChain {
    handler: Option<Arc<dyn Handler>>,
    next: Option<Box<CallChain>>,
}

impl CallChain {
    /// An empty chain; hands any input back unchanged.
    pub fn new() -> Self {
        CallChain { handler: None, next: None }
    }

    pub fn with(handler: Arc<dyn Handler>) -> Self {
        CallChain { handler: Some(handler), next: None }
    }

    /// Append a handler at the end of the chain.
    pub fn bind(mut self, next: Arc<dyn Handler>) -> Self {
        self.push_tail(CallChain::with(next));
        self
    }

    fn push_tail(&mut self, node: CallChain) {
        match self.next {
            Some(ref mut tail) => tail.push_tail(node),
            None => self.next = Some(Box::new(node)),
        }
    }
}

impl Default for CallChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for CallChain {
    async fn handle(&self, message: Value) -> Result<Routed, ClientError> {
        let mut message = message;
        if let Some(handler) = &self.handler {
            match handler.handle(message).await? {
                Routed::Handled(v) => message = v,
                Routed::Passed => return Ok(Routed::Passed),
            }
        }
        match &self.next {
            Some(next) => {
                debug!(%message, "chaining to successor");
                next.handle(message).await
            }
            None => Ok(Routed::Handled(message)),
        }
    }
}
