//! Pattern-matching message router.
//!
//! A router is an ordered list of `(pattern, handler)` routes plus a sink.
//! The first route whose pattern matches gets the message; a handler
//! returning [`Routed::Passed`] yields back so matching continues, and
//! anything no route takes goes to the sink. Routers implement
//! [`Handler`] themselves, so they nest inside chains and other routers
//! with no special casing.

use crate::chain::{Handler, Routed};
use crate::error::ClientError;
use crate::matching;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct MessageRouter {
    routes: Vec<(Value, Arc<dyn Handler>)>,
    sink: Arc<dyn Handler>,
    strict: bool,
}

struct DefaultSink;

#[async_trait]
impl Handler for DefaultSink {
    async fn handle(&self, message: Value) -> Result<Routed, ClientError> {
        warn!(%message, "unhandled message reached the default sink");
        Ok(Routed::Handled(message))
    }
}

impl MessageRouter {
    /// A router with lenient matching (`equal_or_greater`) and the default
    /// warn-and-return sink.
    pub fn new(routes: Vec<(Value, Arc<dyn Handler>)>) -> Self {
        MessageRouter {
            routes,
            sink: Arc::new(DefaultSink),
            strict: false,
        }
    }

    /// A router that requires exact structural equality to match.
    pub fn new_strict(routes: Vec<(Value, Arc<dyn Handler>)>) -> Self {
        MessageRouter { strict: true, ..Self::new(routes) }
    }

    /// Replace the sink; returns the router for fluent construction.
    pub fn bind(mut self, sink: Arc<dyn Handler>) -> Self {
        self.sink = sink;
        self
    }
}

#[async_trait]
impl Handler for MessageRouter {
    async fn handle(&self, message: Value) -> Result<Routed, ClientError> {
        for (pattern, handler) in &self.routes {
            let matched = if self.strict {
                matching::equal(&message, pattern)?
            } else {
                matching::equal_or_greater(&message, pattern)?
            };
            if matched {
                debug!(%message, %pattern, "routing message");
                match handler.handle(message.clone()).await? {
                    Routed::Handled(v) => return Ok(Routed::Handled(v)),
                    // rejected by the handler; keep matching
                    Routed::Passed => {}
                }
            }
        }
        debug!(%message, "passing message to sink");
        self.sink.handle(message).await
    }
}
